//! Configuration handling for the postbox binary.
//!
//! Settings come from an optional YAML file and are then overridden by
//! environment variables. Missing files and keys fall back to defaults.

use anyhow::{bail, Result};
use postbox_relay::{PostOfficeConfig, RelayConfig, MAX_MESSAGE_LEN};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Postbox configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PostboxConfig {
    /// Transport daemon address
    pub connect_string: String,
    /// Preferred client name
    pub client_id: String,
    /// Largest accepted message in bytes
    pub max_message_len: usize,
    /// Keep-alive interval in milliseconds; 0 disables keep-alives
    pub keep_alive_interval_ms: u64,
    /// Relay queue sizes and pacing
    pub relay: RelaySettings,
}

/// Relay section of the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    /// Subscription command queue size
    pub command_capacity: usize,
    /// Inbound queue size
    pub inbound_capacity: usize,
    /// Outbound queue size
    pub outbound_capacity: usize,
    /// Idle sleep in milliseconds
    pub idle_interval_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            command_capacity: relay.command_capacity,
            inbound_capacity: relay.inbound_capacity,
            outbound_capacity: relay.outbound_capacity,
            idle_interval_ms: relay.idle_interval.as_millis() as u64,
        }
    }
}

impl Default for PostboxConfig {
    fn default() -> Self {
        Self {
            connect_string: "4803@localhost".to_string(),
            client_id: "postbox".to_string(),
            max_message_len: MAX_MESSAGE_LEN,
            keep_alive_interval_ms: 2000,
            relay: RelaySettings::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    postbox: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    connect_string: Option<String>,
    client_id: Option<String>,
    max_message_len: Option<usize>,
    keep_alive_interval_ms: Option<u64>,
    relay: Option<RelaySection>,
}

#[derive(Debug, Deserialize)]
struct RelaySection {
    command_capacity: Option<usize>,
    inbound_capacity: Option<usize>,
    outbound_capacity: Option<usize>,
    idle_interval_ms: Option<u64>,
}

impl PostboxConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Final postbox configuration: connect_string={}, client_id={}, idle_interval={}ms",
            config.connect_string, config.client_id, config.relay.idle_interval_ms
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        let Some(service) = root_config.postbox else {
            return;
        };

        if let Some(connect_string) = service.connect_string {
            self.connect_string = connect_string;
        }
        if let Some(client_id) = service.client_id {
            self.client_id = client_id;
        }
        if let Some(max_message_len) = service.max_message_len {
            self.max_message_len = max_message_len;
        }
        if let Some(interval) = service.keep_alive_interval_ms {
            self.keep_alive_interval_ms = interval;
        }

        if let Some(relay) = service.relay {
            if let Some(capacity) = relay.command_capacity {
                self.relay.command_capacity = capacity;
            }
            if let Some(capacity) = relay.inbound_capacity {
                self.relay.inbound_capacity = capacity;
            }
            if let Some(capacity) = relay.outbound_capacity {
                self.relay.outbound_capacity = capacity;
            }
            if let Some(interval) = relay.idle_interval_ms {
                self.relay.idle_interval_ms = interval;
            }
        }
    }

    /// Reject settings the relay cannot run with
    fn validate(&self) -> Result<()> {
        let capacities = [
            ("relay.command_capacity", self.relay.command_capacity),
            ("relay.inbound_capacity", self.relay.inbound_capacity),
            ("relay.outbound_capacity", self.relay.outbound_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                bail!("{} must be at least 1", name);
            }
        }
        if self.max_message_len == 0 {
            bail!("max_message_len must be at least 1");
        }
        Ok(())
    }

    /// Apply environment variable overrides looked up through `var`
    fn apply_environment_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(connect_string) = var("POSTBOX_CONNECT_STRING") {
            self.connect_string = connect_string;
            info!("Connect string overridden by environment: {}", self.connect_string);
        }

        if let Some(client_id) = var("POSTBOX_CLIENT_ID") {
            self.client_id = client_id;
            info!("Client id overridden by environment: {}", self.client_id);
        }

        if let Some(interval) = var("POSTBOX_IDLE_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(ms) => {
                    self.relay.idle_interval_ms = ms;
                    info!("Idle interval overridden by environment: {}ms", ms);
                }
                Err(_) => warn!("Ignoring invalid POSTBOX_IDLE_INTERVAL_MS={}", interval),
            }
        }
    }

    /// Settings for a post office using `client_id`
    pub fn post_office_config(&self, client_id: &str) -> PostOfficeConfig {
        PostOfficeConfig {
            connect_string: self.connect_string.clone(),
            client_identifier: client_id.to_string(),
            max_message_len: self.max_message_len,
            keep_alive_interval: match self.keep_alive_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Settings for the relay worker
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            command_capacity: self.relay.command_capacity,
            inbound_capacity: self.relay.inbound_capacity,
            outbound_capacity: self.relay.outbound_capacity,
            idle_interval: Duration::from_millis(self.relay.idle_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PostboxConfig::default();
        assert_eq!(config.connect_string, "4803@localhost");
        assert_eq!(config.max_message_len, 102400);
        assert_eq!(config.relay.command_capacity, 64);
        assert_eq!(config.relay.inbound_capacity, 1024);
        assert_eq!(config.relay.outbound_capacity, 1024);
        assert_eq!(config.relay.idle_interval_ms, 100);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
postbox:
  connect_string: "4803@daemon"
  client_id: "feeder"
  keep_alive_interval_ms: 0
  relay:
    inbound_capacity: 16
    idle_interval_ms: 25
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = PostboxConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.connect_string, "4803@daemon");
        assert_eq!(config.client_id, "feeder");
        assert_eq!(config.relay.inbound_capacity, 16);
        assert_eq!(config.relay.outbound_capacity, 1024);

        let relay = config.relay_config();
        assert_eq!(relay.idle_interval, Duration::from_millis(25));
        assert_eq!(config.post_office_config("feeder").keep_alive_interval, None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PostboxConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.relay, RelaySettings::default());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let yaml_content = r#"
postbox:
  relay:
    inbound_capacity: 0
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let err = PostboxConfig::load_from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("relay.inbound_capacity"));
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = PostboxConfig::default();
        config.apply_environment_overrides(|key| match key {
            "POSTBOX_CLIENT_ID" => Some("envclient".to_string()),
            "POSTBOX_IDLE_INTERVAL_MS" => Some("7".to_string()),
            _ => None,
        });
        assert_eq!(config.client_id, "envclient");
        assert_eq!(config.relay.idle_interval_ms, 7);
        assert_eq!(config.connect_string, "4803@localhost");

        config.apply_environment_overrides(|key| {
            (key == "POSTBOX_IDLE_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert_eq!(config.relay.idle_interval_ms, 7);

        let post_office = config.post_office_config("other");
        assert_eq!(post_office.client_identifier, "other");
        assert_eq!(post_office.keep_alive_interval, Some(Duration::from_secs(2)));
    }
}
