//! Distributed master/worker control channel.
//!
//! Newline-delimited JSON over TCP. Workers connect out to the master,
//! register with a uuid, and wait for `start`. While running they send
//! cumulative stats reports every few seconds and once more on drain with
//! the final flag set. The master waits for the configured worker count,
//! broadcasts start, runs the duration, sends `quit`, merges the last
//! report from each worker, and writes the master CSV. Workers treat a
//! closed control connection as quit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ResolvedConfig;
use crate::error::{BenchError, Result};
use crate::runner::{RunContext, RunPhase, UserSwarm};
use crate::stats::{log_counter_summary, StatsCollector, StatsRow, MASTER_RESULTS_FILE};

/// Interval between cumulative worker stats reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(3);
/// How long the master waits for final reports after sending quit.
const FINAL_REPORT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Register {
        worker_id: String,
    },
    Start,
    StatsReport {
        rows: Vec<StatsRow>,
        total_requests: u64,
        cache_hits: u64,
        #[serde(rename = "final")]
        is_final: bool,
    },
    Quit,
}

async fn send_message(writer: &mut OwnedWriteHalf, msg: &ControlMessage) -> Result<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Master

#[derive(Debug)]
struct WorkerReport {
    rows: Vec<StatsRow>,
    total_requests: u64,
    cache_hits: u64,
    is_final: bool,
}

enum MasterEvent {
    Registered {
        worker_id: String,
        writer: OwnedWriteHalf,
    },
    Report {
        worker_id: String,
        report: WorkerReport,
    },
    Disconnected {
        worker_id: String,
    },
}

#[derive(Default)]
struct MasterState {
    workers: HashMap<String, OwnedWriteHalf>,
    /// Latest cumulative report per worker; reports replace, never add.
    reports: HashMap<String, WorkerReport>,
    /// Workers that sent their final report or went away after start.
    done: usize,
}

impl MasterState {
    fn apply(&mut self, event: MasterEvent) {
        match event {
            MasterEvent::Registered { worker_id, writer } => {
                if self.workers.insert(worker_id.clone(), writer).is_some() {
                    warn!(worker_id, "duplicate worker registration, replacing");
                } else {
                    info!(worker_id, "Worker registered");
                }
            }
            MasterEvent::Report { worker_id, report } => {
                if report.is_final {
                    self.done += 1;
                    debug!(worker_id, "final worker report received");
                }
                self.reports.insert(worker_id, report);
            }
            MasterEvent::Disconnected { worker_id } => {
                if self.workers.remove(&worker_id).is_some() {
                    warn!(worker_id, "worker disconnected");
                    if self.reports.get(&worker_id).map_or(true, |r| !r.is_final) {
                        self.done += 1;
                    }
                }
            }
        }
    }
}

/// Drain master events for up to `window`, or until `until` says stop.
async fn drain_events(
    rx: &mut mpsc::UnboundedReceiver<MasterEvent>,
    state: &mut MasterState,
    window: Duration,
    until: impl Fn(&MasterState) -> bool,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        if until(state) {
            return;
        }
        tokio::select! {
            _ = &mut deadline => return,
            event = rx.recv() => match event {
                Some(event) => state.apply(event),
                None => return,
            },
        }
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::UnboundedSender<MasterEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "control connection accepted");
                tokio::spawn(worker_reader(stream, tx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "control accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-worker connection reader: first message must be a registration, then
/// a stream of stats reports until EOF.
async fn worker_reader(stream: TcpStream, tx: mpsc::UnboundedSender<MasterEvent>) {
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let worker_id = match lines.next_line().await {
        Ok(Some(line)) => match serde_json::from_str(&line) {
            Ok(ControlMessage::Register { worker_id }) => worker_id,
            Ok(_) | Err(_) => {
                warn!("control connection did not register first, dropping");
                return;
            }
        },
        Ok(None) | Err(_) => return,
    };

    let _ = tx.send(MasterEvent::Registered {
        worker_id: worker_id.clone(),
        writer: write,
    });

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str(&line) {
                Ok(ControlMessage::StatsReport {
                    rows,
                    total_requests,
                    cache_hits,
                    is_final,
                }) => {
                    let _ = tx.send(MasterEvent::Report {
                        worker_id: worker_id.clone(),
                        report: WorkerReport {
                            rows,
                            total_requests,
                            cache_hits,
                            is_final,
                        },
                    });
                }
                Ok(_) => warn!(worker_id, "unexpected message from worker"),
                Err(e) => warn!(worker_id, error = %e, "malformed worker message"),
            },
            Ok(None) | Err(_) => {
                let _ = tx.send(MasterEvent::Disconnected { worker_id });
                return;
            }
        }
    }
}

/// Master mode: coordinate workers, merge their stats, write the master
/// CSV. The master simulates no users of its own.
pub async fn run_master(config: ResolvedConfig) -> Result<()> {
    let addr = config.master_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(phase = %RunPhase::Connecting, "Master listening on {}", addr);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let accept = tokio::spawn(accept_loop(listener, tx));

    let mut state = MasterState::default();
    let wanted = config.num_workers as usize;
    while state.workers.len() < wanted {
        info!(
            "Waiting for workers... ({}/{} connected)",
            state.workers.len(),
            config.num_workers
        );
        drain_events(&mut rx, &mut state, Duration::from_secs(1), |s| {
            s.workers.len() >= wanted
        })
        .await;
    }
    info!(
        "All {} workers are connected. Starting the load test...",
        config.num_workers
    );

    for (worker_id, writer) in state.workers.iter_mut() {
        if let Err(e) = send_message(writer, &ControlMessage::Start).await {
            warn!(worker_id, error = %e, "failed to send start");
        }
    }

    info!(phase = %RunPhase::Running, duration_secs = config.duration_secs, "distributed load test running");
    let started = Instant::now();
    drain_events(&mut rx, &mut state, config.run_duration(), |_| false).await;

    info!(phase = %RunPhase::Draining, "sending quit to workers");
    for (worker_id, writer) in state.workers.iter_mut() {
        if let Err(e) = send_message(writer, &ControlMessage::Quit).await {
            warn!(worker_id, error = %e, "failed to send quit");
        }
    }
    let connected = state.workers.len();
    state.done = state.reports.values().filter(|r| r.is_final).count();
    drain_events(&mut rx, &mut state, FINAL_REPORT_GRACE, |s| {
        s.done >= connected
    })
    .await;
    accept.abort();

    let run_secs = started.elapsed().as_secs_f64();
    let merged = StatsCollector::new();
    let mut total_requests = 0u64;
    let mut cache_hits = 0u64;
    for report in state.reports.values() {
        merged.merge_rows(report.rows.clone());
        total_requests += report.total_requests;
        cache_hits += report.cache_hits;
    }

    info!(phase = %RunPhase::Stopped, "distributed load test completed");
    log_counter_summary(total_requests, cache_hits);
    merged.print_summary(run_secs);
    merged.write_csv(MASTER_RESULTS_FILE, run_secs)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker

fn stats_report(ctx: &RunContext, is_final: bool) -> ControlMessage {
    ControlMessage::StatsReport {
        rows: ctx.stats.snapshot(),
        total_requests: ctx.counters.total(),
        cache_hits: ctx.counters.hits(),
        is_final,
    }
}

/// Worker mode: register with the master, run users on start, report
/// periodically, drain on quit or when the control channel closes. Failure
/// to reach the master is fatal.
pub async fn run_worker(ctx: Arc<RunContext>) -> Result<()> {
    let addr = ctx.config.master_addr();
    info!("Worker connecting to Master at {}...", addr);
    let stream = TcpStream::connect(&addr).await.map_err(|e| {
        BenchError::TaskFailed(format!("cannot reach master at {}: {}", addr, e))
    })?;
    let (read, mut write) = stream.into_split();

    let worker_id = Uuid::new_v4().to_string();
    send_message(
        &mut write,
        &ControlMessage::Register {
            worker_id: worker_id.clone(),
        },
    )
    .await?;
    info!(worker_id, "registered, waiting for start");

    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await? {
            Some(line) => match serde_json::from_str(&line)? {
                ControlMessage::Start => break,
                _ => warn!("unexpected message before start"),
            },
            None => {
                return Err(BenchError::TaskFailed(
                    "master closed the control channel before start".into(),
                ));
            }
        }
    }

    info!(worker_id, phase = %RunPhase::Running, "start received, spawning users");
    let swarm = UserSwarm::launch(ctx.clone());
    let mut report_timer = tokio::time::interval(REPORT_INTERVAL);
    report_timer.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = report_timer.tick() => {
                if let Err(e) = send_message(&mut write, &stats_report(&ctx, false)).await {
                    warn!(error = %e, "failed to send stats report, stopping");
                    break;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str(&line) {
                    Ok(ControlMessage::Quit) => {
                        info!("quit received from master");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "malformed master message"),
                },
                Ok(None) => {
                    info!("control channel closed by master, stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "control channel read failed, stopping");
                    break;
                }
            }
        }
    }

    info!(phase = %RunPhase::Draining, "stopping users");
    swarm.stop().await?;
    if let Err(e) = send_message(&mut write, &stats_report(&ctx, true)).await {
        warn!(error = %e, "failed to send final stats report");
    }
    info!(phase = %RunPhase::Stopped, "Worker load test completed");
    ctx.counters.log_summary();
    Ok(())
}
