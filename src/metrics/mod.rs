//! Metrics collection for load runs
//!
//! Sessions and the harness report through the [`MetricsSink`] trait; the
//! bundled [`Aggregator`] accumulates counters and latency samples in memory
//! and is safe to share across thousands of tasks.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handshake + probe + CONNECT completed (counter)
pub const CONNECT_SUCCESS: &str = "connect.success";
/// Connect attempts that failed, suffixed by error kind (counter)
pub const CONNECT_FAILURE: &str = "connect.failure";
/// Time from `connect()` to CONNECT reply, ms (latency)
pub const CONNECT_LATENCY: &str = "connect.latency_ms";
/// Credential acquisition failures (counter)
pub const AUTH_FAILURE: &str = "auth.failure";
/// Events sent without reply (counter)
pub const EMIT_SENT: &str = "emit.sent";
/// Acknowledged events answered in time (counter)
pub const ACK_SUCCESS: &str = "ack.success";
/// Acknowledged events that failed, suffixed by error kind (counter)
pub const ACK_FAILURE: &str = "ack.failure";
/// Round trip of acknowledged events, ms (latency)
pub const ACK_RTT: &str = "ack.rtt_ms";
/// Inbound events, suffixed by event name (counter)
pub const EVENT_RECEIVED: &str = "event.received";
/// `wait_for` steps that saw their event (counter)
pub const WAIT_SUCCESS: &str = "wait.success";
/// `wait_for` steps that timed out (counter)
pub const WAIT_TIMEOUT: &str = "wait.timeout";
/// Sessions that ended before the script finished (counter)
pub const SESSION_DROPPED: &str = "session.dropped";

/// Minimal collector contract used by the harness
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);

    fn record(&self, name: &str, value: f64);
}

/// Join a metric name and a qualifier, e.g. `connect.failure.handshake`
pub fn qualified(name: &str, qualifier: &str) -> String {
    format!("{}.{}", name, qualifier)
}

/// In-memory, lock-striped metrics store
#[derive(Default)]
pub struct Aggregator {
    counters: DashMap<String, AtomicU64>,
    samples: DashMap<String, Mutex<Vec<f64>>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out counters and latency summaries
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let latencies = self
            .samples
            .iter()
            .filter_map(|entry| {
                let samples = entry.value().lock().clone();
                LatencySummary::from_samples(samples).map(|s| (entry.key().clone(), s))
            })
            .collect();

        MetricsSnapshot { counters, latencies }
    }
}

impl MetricsSink for Aggregator {
    fn increment(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, name: &str, value: f64) {
        if let Some(samples) = self.samples.get(name) {
            samples.lock().push(value);
            return;
        }
        self.samples
            .entry(name.to_string())
            .or_default()
            .lock()
            .push(value);
    }
}

/// Distribution summary of one latency metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencySummary {
    /// Summarise samples; `None` when there are none
    pub fn from_samples(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let count = samples.len();
        let percentile = |p: f64| {
            let rank = ((p / 100.0) * count as f64).ceil() as usize;
            samples[rank.clamp(1, count) - 1]
        };

        Some(Self {
            count,
            min: samples[0],
            mean: samples.iter().sum::<f64>() / count as f64,
            p50: percentile(50.0),
            p95: percentile(95.0),
            p99: percentile(99.0),
            max: samples[count - 1],
        })
    }
}

/// Point-in-time copy of an [`Aggregator`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub latencies: BTreeMap<String, LatencySummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Sum of every counter under `prefix.`
    pub fn counter_family(&self, prefix: &str) -> u64 {
        let dotted = format!("{}.", prefix);
        self.counters
            .iter()
            .filter(|(name, _)| name.starts_with(&dotted))
            .map(|(_, value)| value)
            .sum()
    }
}
