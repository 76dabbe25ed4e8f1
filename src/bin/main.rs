use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use cache_bench::client::factory_for;
use cache_bench::config::{CacheKind, ClusterRole, CommonOpts, ResolvedConfig};
use cache_bench::control::{run_master, run_worker};
use cache_bench::prime::prime_cache;
use cache_bench::runner::{run_local, RunContext};
use cache_bench::telemetry;

#[derive(Parser)]
#[command(name = "cache-bench", version, about = "Cache load-generation harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a load test against a cache backend.
    Loadtest {
        #[command(subcommand)]
        mode: Mode,
    },
    /// Pre-populate the bounded hit-path key space, then exit.
    Init {
        #[arg(value_enum)]
        backend: Backend,
        #[command(flatten)]
        opts: CommonOpts,
    },
}

#[derive(Subcommand)]
enum Mode {
    /// Single-process run: users, duration, and reporting in one process.
    Local {
        #[arg(value_enum)]
        backend: Backend,
        #[command(flatten)]
        opts: CommonOpts,
    },
    /// Distributed run: this process is the master or a worker, per
    /// the cluster-mode setting.
    Cluster {
        #[arg(value_enum)]
        backend: Backend,
        #[command(flatten)]
        opts: CommonOpts,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Redis in cluster topology.
    Redis,
    /// Valkey in cluster topology.
    Valkey,
    RedisStandalone,
    ValkeyStandalone,
}

impl From<Backend> for CacheKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Redis => CacheKind::RedisCluster,
            Backend::Valkey => CacheKind::ValkeyCluster,
            Backend::RedisStandalone => CacheKind::RedisStandalone,
            Backend::ValkeyStandalone => CacheKind::ValkeyStandalone,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Loadtest { mode } => match mode {
            Mode::Local { backend, opts } => {
                let config = ResolvedConfig::resolve(&opts, backend.into())?;
                run(config, |ctx| run_local(ctx)).await
            }
            Mode::Cluster { backend, opts } => {
                let config = ResolvedConfig::resolve(&opts, backend.into())?;
                let Some(role) = config.cluster_mode else {
                    bail!("loadtest cluster requires cluster_mode to be set to master or worker");
                };
                match role {
                    ClusterRole::Master => {
                        let telemetry = telemetry::init(&config);
                        info!(role = %role, "starting distributed load test");
                        let result = run_master(config).await;
                        telemetry.shutdown();
                        Ok(result?)
                    }
                    ClusterRole::Worker => run(config, |ctx| run_worker(ctx)).await,
                }
            }
        },
        Command::Init { backend, opts } => {
            let config = ResolvedConfig::resolve(&opts, backend.into())?;
            let telemetry = telemetry::init(&config);
            let factory = factory_for(&config);
            let result = prime_cache(&config, factory).await;
            telemetry.shutdown();
            Ok(result?)
        }
    }
}

/// Shared run scaffolding for the modes that simulate users: telemetry up,
/// context built, the mode-specific driver, telemetry flushed either way.
async fn run<F, Fut>(config: ResolvedConfig, driver: F) -> Result<()>
where
    F: FnOnce(Arc<RunContext>) -> Fut,
    Fut: std::future::Future<Output = cache_bench::error::Result<()>>,
{
    let telemetry = telemetry::init(&config);
    info!(backend = %config.cache_kind, "cache-bench starting");
    let factory = factory_for(&config);
    let ctx = RunContext::new(config, factory, telemetry.metrics());
    let result = driver(ctx).await;
    telemetry.shutdown();
    Ok(result?)
}
