//! Postbox demo binary.
//!
//! Runs a consumer and a number of producers, each behind its own message
//! relay, on an in-process loopback hub and reports what arrived.

use anyhow::{bail, Context};
use clap::Parser;
use postbox_relay::{LoopbackHub, MessageRelay, PostOffice, RelayHandle};
use postbox_wire::AttributeMessage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::PostboxConfig;
use logging::PostboxLogFormatter;

/// Non-blocking messaging demo over an in-process transport
#[derive(Parser, Debug)]
#[command(name = "postbox", version, about = "Producer/consumer demo over the postbox relay")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "postbox.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of producer relays
    #[arg(long, default_value = "4")]
    producers: usize,

    /// Messages sent by each producer
    #[arg(long, default_value = "100")]
    messages: usize,

    /// Topic the producers publish on
    #[arg(long, default_value = "Demo")]
    topic: String,

    /// Give up waiting for the next message after this long, e.g. 5s
    #[arg(long, default_value = "5s")]
    timeout: humantime::Duration,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

/// Outcome of a demo run
#[derive(Debug, Serialize)]
struct Summary {
    expected: usize,
    received: usize,
    duplicates: usize,
    per_producer: BTreeMap<String, usize>,
    elapsed_ms: u128,
    messages_per_sec: f64,
    protocol_errors: u64,
    send_failures: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("postbox={}", args.log_level).parse()?)
        .add_directive(format!("postbox_relay={}", args.log_level).parse()?)
        .add_directive(format!("postbox_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(PostboxLogFormatter::new("postbox"))
        .init();

    info!("Starting postbox v{}", env!("CARGO_PKG_VERSION"));

    let config = PostboxConfig::load_from_file(&args.config)?;
    if args.producers == 0 || args.messages == 0 {
        bail!("--producers and --messages must be at least 1");
    }

    let hub = LoopbackHub::new("postbox").with_max_message_len(config.max_message_len);

    tokio::select! {
        summary = run_demo(&args, &config, &hub) => {
            let summary = summary?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                info!(
                    "Received {}/{} messages ({} duplicates) in {}ms",
                    summary.received, summary.expected, summary.duplicates, summary.elapsed_ms
                );
                for (producer, count) in &summary.per_producer {
                    info!(component = "consumer", "{}: {} messages", producer, count);
                }
            }
            if summary.received != summary.expected || summary.duplicates > 0 {
                bail!("demo lost or duplicated messages");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
        }
    }

    info!("Postbox shutdown complete");
    Ok(())
}

async fn run_demo(
    args: &Args,
    config: &PostboxConfig,
    hub: &LoopbackHub,
) -> anyhow::Result<Summary> {
    let consumer = start_relay(config, hub, &format!("{}-in", config.client_id));
    let inbox = consumer.handle();
    let version = inbox.version().await?;
    info!(component = "consumer", "Relay {}", version);

    inbox.subscribe(args.topic.clone()).await?;
    wait_for_subscription(hub, &args.topic, *args.timeout).await?;
    let address = inbox.client_address().await?;
    info!(component = "consumer", "Subscribed to {} as {}", args.topic, address);

    let started = Instant::now();
    let mut producers = Vec::with_capacity(args.producers);
    let mut tasks = Vec::with_capacity(args.producers);
    for p in 0..args.producers {
        let relay = start_relay(config, hub, &config.client_id);
        let handle = relay.handle();
        producers.push(relay);
        tasks.push(tokio::spawn(produce(
            handle,
            args.topic.clone(),
            format!("producer-{}", p),
            args.messages,
        )));
    }

    let expected = args.producers * args.messages;
    let mut seen = std::collections::HashSet::with_capacity(expected);
    let mut per_producer = BTreeMap::new();
    let mut duplicates = 0;

    while seen.len() < expected {
        let Some(message) = inbox.receive_attributes(*args.timeout).await? else {
            warn!(
                component = "consumer",
                "No message within {}, giving up",
                args.timeout
            );
            break;
        };

        let producer = message.attr("producer").unwrap_or("unknown").to_string();
        let seq = message.attr("seq").unwrap_or_default().to_string();
        if seen.insert((producer.clone(), seq)) {
            *per_producer.entry(producer).or_insert(0) += 1;
        } else {
            duplicates += 1;
        }
    }
    let elapsed = started.elapsed();

    for task in tasks {
        task.await.context("producer task failed")??;
    }

    let stats = inbox.stats();
    let summary = Summary {
        expected,
        received: seen.len(),
        duplicates,
        per_producer,
        elapsed_ms: elapsed.as_millis(),
        messages_per_sec: seen.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        protocol_errors: stats.protocol_errors(),
        send_failures: stats.send_failures(),
    };

    for relay in producers {
        relay.shutdown().await?;
    }
    consumer.shutdown().await?;

    Ok(summary)
}

fn start_relay(config: &PostboxConfig, hub: &LoopbackHub, client_id: &str) -> MessageRelay {
    let post_office = PostOffice::new(hub.transport(), config.post_office_config(client_id));
    MessageRelay::start(post_office, config.relay_config())
}

async fn produce(
    relay: RelayHandle,
    topic: String,
    producer: String,
    messages: usize,
) -> anyhow::Result<()> {
    let address = relay.client_address().await?;
    debug!(component = "producer", "{} sending as {}", producer, address);

    for seq in 0..messages {
        let message = AttributeMessage::new(topic.as_str())
            .with_body(format!("message {} from {}", seq, producer))
            .with_attr("producer", producer.as_str())
            .with_attr("seq", seq.to_string());
        relay.send_attributes(&message).await?;
    }

    debug!(component = "producer", "{} queued {} messages", producer, messages);
    Ok(())
}

async fn wait_for_subscription(
    hub: &LoopbackHub,
    topic: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    while hub.members(topic).is_empty() {
        if Instant::now() >= deadline {
            bail!("subscription to {} not applied within {:?}", topic, timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
