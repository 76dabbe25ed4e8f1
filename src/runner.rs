//! Run driver: user ramp-up, constant per-user throughput, graceful stop.
//!
//! A run moves `Idle -> Connecting -> Running -> Draining -> Stopped`. One
//! tokio task per simulated user; each user acquires the shared connection,
//! loops the traffic scenario at the configured request rate, and releases
//! on stop. The stop signal is a watch channel; in-flight operations finish
//! normally before a user exits.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::ClientFactory;
use crate::config::ResolvedConfig;
use crate::connection::SharedConnection;
use crate::error::Result;
use crate::executor::{OpExecutor, RetryPolicy};
use crate::stats::{RunCounters, StatsCollector, LOCAL_RESULTS_FILE};
use crate::telemetry::OpMetrics;
use crate::traffic::cache_scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Connecting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Connecting => "connecting",
            RunPhase::Running => "running",
            RunPhase::Draining => "draining",
            RunPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything one run shares across its user tasks: the immutable config,
/// the counters, the stats registry, the shared connection, and the
/// executor. Explicitly constructed and passed; nothing is process-global,
/// so concurrent runs in tests stay isolated.
pub struct RunContext {
    pub config: ResolvedConfig,
    pub counters: RunCounters,
    pub stats: Arc<StatsCollector>,
    pub connection: SharedConnection,
    pub executor: OpExecutor,
}

impl RunContext {
    pub fn new(
        config: ResolvedConfig,
        factory: Arc<dyn ClientFactory>,
        metrics: Option<Arc<OpMetrics>>,
    ) -> Arc<Self> {
        let stats = Arc::new(StatsCollector::new());
        let executor = OpExecutor::new(
            config.cache_kind,
            RetryPolicy::from_config(&config),
            stats.clone(),
            metrics,
        );
        Arc::new(RunContext {
            connection: SharedConnection::new(factory),
            counters: RunCounters::new(),
            config,
            stats,
            executor,
        })
    }
}

/// A ramped swarm of user tasks, stoppable as a unit. Used by both local
/// and worker modes.
pub struct UserSwarm {
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl UserSwarm {
    pub fn launch(ctx: Arc<RunContext>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(ctx, stop_rx));
        UserSwarm {
            stop: stop_tx,
            supervisor,
        }
    }

    /// Signal every user to stop, then wait for all of them to release.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.supervisor.await?;
        Ok(())
    }
}

/// Ramp users toward the configured concurrency at `spawn_rate` users per
/// second, then wait for all of them to finish.
async fn supervise(ctx: Arc<RunContext>, stop: watch::Receiver<bool>) {
    let total = ctx.config.connections;
    let per_tick = ctx.config.spawn_rate;
    let mut users = JoinSet::new();
    let mut ramp_stop = stop.clone();
    let mut spawned = 0u32;

    while spawned < total {
        let batch = per_tick.min(total - spawned);
        for _ in 0..batch {
            spawned += 1;
            users.spawn(user_loop(ctx.clone(), stop.clone(), spawned));
        }
        debug!(spawned, total, "ramp-up progress");
        if spawned < total {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ramp_stop.changed() => break,
            }
        }
    }

    while let Some(joined) = users.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "user task failed");
        }
    }
}

/// One simulated user: acquire, loop the scenario at constant throughput,
/// release. The inter-request wait is the remainder of `1/request_rate`
/// after each iteration.
async fn user_loop(ctx: Arc<RunContext>, mut stop: watch::Receiver<bool>, user_id: u32) {
    let conn = ctx.connection.acquire().await;
    match &conn {
        Some(_) => info!(user_id, "user connected (shared)"),
        None => error!(user_id, "user connection failed"),
    }

    let interval = Duration::from_secs_f64(1.0 / ctx.config.request_rate);
    let mut rng = StdRng::from_entropy();
    loop {
        if *stop.borrow() {
            break;
        }
        let iteration_start = Instant::now();
        cache_scenario(&ctx, conn.as_deref(), &mut rng).await;
        let elapsed = iteration_start.elapsed();
        if elapsed < interval {
            tokio::select! {
                _ = tokio::time::sleep(interval - elapsed) => {}
                _ = stop.changed() => {}
            }
        }
    }

    if conn.is_some() {
        ctx.connection.release().await;
    }
    info!(user_id, "user released connection");
}

/// Single-process run: ramp up, run for the configured duration, drain,
/// then emit the counter summary, the stats table, and the CSV report.
pub async fn run_local(ctx: Arc<RunContext>) -> Result<()> {
    info!(
        phase = %RunPhase::Connecting,
        users = ctx.config.connections,
        spawn_rate = ctx.config.spawn_rate,
        "starting load test"
    );
    let started = Instant::now();
    let swarm = UserSwarm::launch(ctx.clone());

    info!(
        phase = %RunPhase::Running,
        duration_secs = ctx.config.duration_secs,
        "load test running"
    );
    tokio::time::sleep(ctx.config.run_duration()).await;

    info!(phase = %RunPhase::Draining, "signalling users to stop");
    swarm.stop().await?;

    let run_secs = started.elapsed().as_secs_f64();
    info!(phase = %RunPhase::Stopped, "load test completed");
    ctx.counters.log_summary();
    ctx.stats.print_summary(run_secs);
    ctx.stats.write_csv(LOCAL_RESULTS_FILE, run_secs)?;
    Ok(())
}
