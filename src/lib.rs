//! cache-bench: a load-generation harness for Redis and Valkey caches.
//!
//! Drives synthetic GET/SET traffic against a standalone or clustered
//! backend at a configurable hit-rate mix, records per-request latency and
//! outcome, and exports a CSV report plus optional OpenTelemetry
//! traces/metrics. Runs single-process or distributed (master/worker).

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod executor;
pub mod prime;
pub mod runner;
pub mod stats;
pub mod telemetry;
pub mod traffic;

pub use config::{CacheKind, ClusterRole, CommonOpts, ResolvedConfig};
pub use error::{BenchError, ClientError, ClientResult, ErrorKind, Result};
pub use runner::RunContext;
pub use stats::{RequestOutcome, RunCounters, StatsCollector, StatsSink};
