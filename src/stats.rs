//! Run accounting: shared counters, per-request statistics, CSV export.
//!
//! [`RunCounters`] holds the two run-wide counters every simulated user
//! increments. [`StatsCollector`] is the stats sink the executor fires one
//! [`RequestOutcome`] into per operation; it keeps one entry per
//! (request type, name) pair with a t-digest for latency percentiles.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tdigest::TDigest;
use tracing::info;

use crate::error::{ClientError, Result};

/// CSV written at the end of a local run.
pub const LOCAL_RESULTS_FILE: &str = "redis_test_results.csv";
/// CSV written by the master after merging worker reports.
pub const MASTER_RESULTS_FILE: &str = "redis_test_results_master.csv";

const DIGEST_BATCH: usize = 1024;

/// One completed operation attempt sequence, as emitted by the executor.
/// Folded into the collector immediately, never stored individually.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_type: &'static str,
    pub name: String,
    pub response_time_ms: f64,
    pub response_length: usize,
    pub error: Option<ClientError>,
}

/// Sink for completed operations: exactly one `fire` per executor
/// invocation, regardless of how many retries it took.
pub trait StatsSink: Send + Sync {
    fn fire(&self, outcome: RequestOutcome);
}

/// Run-scoped counters shared across all simulated users.
#[derive(Debug, Default)]
pub struct RunCounters {
    total: AtomicU64,
    hits: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        RunCounters::default()
    }

    pub fn increment_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Hit rate percentage, or `None` when no requests ran.
    pub fn hit_rate_pct(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            None
        } else {
            Some(self.hits() as f64 / total as f64 * 100.0)
        }
    }

    pub fn log_summary(&self) {
        log_counter_summary(self.total(), self.hits());
    }
}

/// End-of-run counter lines. Shared with the master, which aggregates
/// worker counters instead of owning a `RunCounters`.
pub fn log_counter_summary(total: u64, hits: u64) {
    if total > 0 {
        info!("Total Requests: {}", total);
        info!("Cache Hits: {}", hits);
        info!("Cache Hit Rate: {:.2}%", hits as f64 / total as f64 * 100.0);
    } else {
        info!("Total Requests: 0");
        info!("Cache Hit Rate: N/A");
    }
}

/// Serializable snapshot of one stats entry, exchanged over the control
/// channel. Percentile digests stay local to the emitting process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsRow {
    pub request_type: String,
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

struct StatsEntry {
    requests: u64,
    failures: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
    digest: TDigest,
    pending: Vec<f64>,
}

impl StatsEntry {
    fn new() -> Self {
        StatsEntry {
            requests: 0,
            failures: 0,
            total_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            digest: TDigest::new_with_size(100),
            pending: Vec::new(),
        }
    }

    fn record(&mut self, ms: f64, failed: bool) {
        self.requests += 1;
        if failed {
            self.failures += 1;
        }
        self.total_ms += ms;
        self.min_ms = self.min_ms.min(ms);
        self.max_ms = self.max_ms.max(ms);
        self.pending.push(ms);
        if self.pending.len() >= DIGEST_BATCH {
            self.flush_digest();
        }
    }

    fn flush_digest(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let digest = std::mem::replace(&mut self.digest, TDigest::new_with_size(100));
        self.digest = digest.merge_unsorted(pending);
    }

    fn avg_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_ms / self.requests as f64
        }
    }

    fn min_or_zero(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.min_ms
        }
    }

    fn percentile(&self, q: f64) -> f64 {
        if self.digest.count() == 0.0 {
            0.0
        } else {
            self.digest.estimate_quantile(q)
        }
    }
}

/// Per-(request type, name) statistics registry. Locked with a plain mutex;
/// nothing awaits while holding it.
pub struct StatsCollector {
    entries: Mutex<BTreeMap<(String, String), StatsEntry>>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        StatsCollector::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Serializable rows for the control channel, in name order.
    pub fn snapshot(&self) -> Vec<StatsRow> {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|((request_type, name), e)| StatsRow {
                request_type: request_type.clone(),
                name: name.clone(),
                requests: e.requests,
                failures: e.failures,
                total_ms: e.total_ms,
                min_ms: e.min_or_zero(),
                max_ms: e.max_ms,
            })
            .collect()
    }

    /// Fold worker snapshot rows in: counts and totals sum, min of min,
    /// max of max. Digests are not reconstructed from rows.
    pub fn merge_rows(&self, rows: Vec<StatsRow>) {
        let mut entries = self.entries.lock();
        for row in rows {
            let entry = entries
                .entry((row.request_type, row.name))
                .or_insert_with(StatsEntry::new);
            entry.requests += row.requests;
            entry.failures += row.failures;
            entry.total_ms += row.total_ms;
            if row.requests > 0 {
                entry.min_ms = entry.min_ms.min(row.min_ms);
                entry.max_ms = entry.max_ms.max(row.max_ms);
            }
        }
    }

    /// Console summary table: the CSV columns plus latency percentiles.
    pub fn print_summary(&self, run_secs: f64) {
        let mut entries = self.entries.lock();
        println!("\n=== Request Statistics ===");
        println!(
            "{:<28} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8} {:>8} {:>8} {:>9}",
            "Name", "Requests", "Fails", "Avg(ms)", "Min(ms)", "Max(ms)", "p50", "p95", "p99", "RPS"
        );
        for ((request_type, name), entry) in entries.iter_mut() {
            entry.flush_digest();
            let rps = if run_secs > 0.0 {
                entry.requests as f64 / run_secs
            } else {
                0.0
            };
            println!(
                "{:<28} {:>9} {:>9} {:>9.2} {:>9.2} {:>9.2} {:>8.2} {:>8.2} {:>8.2} {:>9.2}",
                format!("{} {}", request_type, name),
                entry.requests,
                entry.failures,
                entry.avg_ms(),
                entry.min_or_zero(),
                entry.max_ms,
                entry.percentile(0.50),
                entry.percentile(0.95),
                entry.percentile(0.99),
                rps,
            );
        }
        println!();
    }

    /// Write the final report: one row per (request type, name) pair.
    pub fn write_csv(&self, path: impl AsRef<Path>, run_secs: f64) -> Result<()> {
        let entries = self.entries.lock();
        let mut file = std::fs::File::create(path.as_ref())?;
        writeln!(
            file,
            "Request Name, Total Requests, Failures, Average Response Time, Min Response Time, Max Response Time, RPS"
        )?;
        for ((_, name), entry) in entries.iter() {
            let rps = if run_secs > 0.0 {
                entry.requests as f64 / run_secs
            } else {
                0.0
            };
            writeln!(
                file,
                "{}, {}, {}, {:.2}, {:.2}, {:.2}, {:.2}",
                name,
                entry.requests,
                entry.failures,
                entry.avg_ms(),
                entry.min_or_zero(),
                entry.max_ms,
                rps,
            )?;
        }
        info!("Results written to {}", path.as_ref().display());
        Ok(())
    }
}

impl StatsSink for StatsCollector {
    fn fire(&self, outcome: RequestOutcome) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((outcome.request_type.to_string(), outcome.name))
            .or_insert_with(StatsEntry::new);
        entry.record(outcome.response_time_ms, outcome.error.is_some());
    }
}
