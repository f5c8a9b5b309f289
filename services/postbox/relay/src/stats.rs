//! Throughput and loop counters for the relay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default sliding window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Rates over the current window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    /// Messages per second
    pub messages_per_sec: f64,
    /// Bytes per second
    pub bytes_per_sec: f64,
}

/// Sliding-window message and byte counter
#[derive(Debug)]
pub struct ThroughputStatistics {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, usize)>>,
}

impl ThroughputStatistics {
    /// Create a counter over `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one message of `bytes`
    pub fn add(&self, bytes: usize) {
        self.add_at(Instant::now(), bytes);
    }

    fn add_at(&self, now: Instant, bytes: usize) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::expire(&mut samples, now, self.window);
        samples.push_back((now, bytes));
    }

    /// Rates over the window ending now
    pub fn per_second(&self) -> Throughput {
        self.per_second_at(Instant::now())
    }

    fn per_second_at(&self, now: Instant) -> Throughput {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::expire(&mut samples, now, self.window);

        let secs = self.window.as_secs_f64();
        let bytes: usize = samples.iter().map(|(_, bytes)| bytes).sum();
        Throughput {
            messages_per_sec: samples.len() as f64 / secs,
            bytes_per_sec: bytes as f64 / secs,
        }
    }

    fn expire(samples: &mut VecDeque<(Instant, usize)>, now: Instant, window: Duration) {
        while let Some(&(at, _)) = samples.front() {
            if now.duration_since(at) >= window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ThroughputStatistics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Counters shared between the relay worker and its handles
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Messages handed to the transport
    pub sent: ThroughputStatistics,
    /// Complete messages queued for callers
    pub received: ThroughputStatistics,
    iterations: AtomicU64,
    idle_sleeps: AtomicU64,
    protocol_errors: AtomicU64,
    send_failures: AtomicU64,
}

impl RelayStats {
    /// Loop iterations run so far
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Iterations that found no work and slept
    pub fn idle_sleeps(&self) -> u64 {
        self.idle_sleeps.load(Ordering::Relaxed)
    }

    /// Dropped fragments and undecodable deliveries
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Outbound messages the transport failed to send
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_iteration(&self, idle: bool) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_sleeps.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_over_window() {
        let stats = ThroughputStatistics::new(Duration::from_secs(2));
        let start = Instant::now();
        stats.add_at(start, 100);
        stats.add_at(start, 300);

        let rate = stats.per_second_at(start + Duration::from_millis(500));
        assert_eq!(rate.messages_per_sec, 1.0);
        assert_eq!(rate.bytes_per_sec, 200.0);
    }

    #[test]
    fn test_old_samples_expire() {
        let stats = ThroughputStatistics::new(Duration::from_secs(1));
        let start = Instant::now();
        stats.add_at(start, 10);
        stats.add_at(start + Duration::from_millis(900), 10);

        let rate = stats.per_second_at(start + Duration::from_millis(1500));
        assert_eq!(rate.messages_per_sec, 1.0);

        let rate = stats.per_second_at(start + Duration::from_secs(3));
        assert_eq!(rate, Throughput::default());
    }

    #[test]
    fn test_relay_counters() {
        let stats = RelayStats::default();
        stats.record_iteration(false);
        stats.record_iteration(true);
        stats.record_protocol_error();
        assert_eq!(stats.iterations(), 2);
        assert_eq!(stats.idle_sleeps(), 1);
        assert_eq!(stats.protocol_errors(), 1);
        assert_eq!(stats.send_failures(), 0);
    }
}
