//! Run summaries and the JSON report

use serde::Serialize;
use std::path::Path;

use super::ClientOutcome;
use crate::metrics::{self, MetricsSnapshot};

/// Per-outcome client tallies of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub clients: usize,
    pub completed: usize,
    pub auth_failed: usize,
    pub connect_failed: usize,
    pub dropped: usize,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn add(&mut self, outcome: ClientOutcome) {
        match outcome {
            ClientOutcome::Completed => self.completed += 1,
            ClientOutcome::AuthFailed => self.auth_failed += 1,
            ClientOutcome::ConnectFailed => self.connect_failed += 1,
            ClientOutcome::Dropped => self.dropped += 1,
        }
    }

    /// Share of clients that connected, in `[0, 1]`
    pub fn success_ratio(&self) -> f64 {
        if self.clients == 0 {
            return 0.0;
        }
        (self.completed + self.dropped) as f64 / self.clients as f64
    }
}

/// Everything written at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: String,
    #[serde(flatten)]
    pub summary: RunSummary,
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    pub fn new(target: String, summary: RunSummary, metrics: MetricsSnapshot) -> Self {
        Self {
            target,
            summary,
            metrics,
        }
    }

    /// Write the report as pretty JSON
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, json)
    }

    pub fn print_summary(&self) {
        let s = &self.summary;
        println!("Load run against {}", self.target);
        println!("==========================================");
        println!("Clients:          {}", s.clients);
        println!("Completed:        {}", s.completed);
        println!("Dropped:          {}", s.dropped);
        println!("Connect failures: {}", s.connect_failed);
        println!("Auth failures:    {}", s.auth_failed);
        println!("Success ratio:    {:.1}%", s.success_ratio() * 100.0);
        println!("Elapsed:          {} ms", s.elapsed_ms);

        let acked = self.metrics.counter(metrics::ACK_SUCCESS);
        let requested = acked + self.metrics.counter_family(metrics::ACK_FAILURE);
        if requested > 0 {
            println!("Acks answered:    {}/{}", acked, requested);
        }
        println!();

        println!("Counters:");
        for (name, value) in &self.metrics.counters {
            println!("  {:<32} {}", name, value);
        }

        if !self.metrics.latencies.is_empty() {
            println!();
            println!(
                "  {:<20} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}",
                "latency (ms)", "count", "min", "p50", "p95", "p99", "max"
            );
            for (name, l) in &self.metrics.latencies {
                println!(
                    "  {:<20} {:>8} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
                    name, l.count, l.min, l.p50, l.p95, l.p99, l.max
                );
            }
        }

        let failures = self.metrics.counter_family(metrics::CONNECT_FAILURE);
        if failures > 0 {
            println!();
            println!("Connect failures by kind:");
            let prefix = format!("{}.", metrics::CONNECT_FAILURE);
            for (name, value) in &self.metrics.counters {
                if let Some(kind) = name.strip_prefix(&prefix) {
                    println!("  {:<20} {}", kind, value);
                }
            }
        }
    }
}
