//! Resilient operation executor.
//!
//! Wraps one cache GET or SET in latency timing, a client span, and bounded
//! retry for transient error kinds. Exactly one [`RequestOutcome`] is
//! emitted per invocation: intermediate failures masked by a later success
//! leave no trace in the stats or on the span. No error ever propagates to
//! the caller; a GET that exhausts its retries is indistinguishable from a
//! true miss.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, Instrument};

use crate::client::CacheClient;
use crate::config::{CacheKind, ResolvedConfig};
use crate::error::{ClientError, ClientResult};
use crate::stats::{RequestOutcome, StatsSink};
use crate::telemetry::OpMetrics;

/// Exponential backoff base in seconds; doubled per failed attempt, capped
/// at the configured retry wait.
const BACKOFF_BASE_SECS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Always >= 1.
    pub attempts: u32,
    /// Cap on the wait between attempts.
    pub wait_cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        RetryPolicy {
            attempts: config.retry_attempts,
            wait_cap: Duration::from_secs(config.retry_wait_secs),
        }
    }

    /// Wait before re-attempting after the given zero-based failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = BACKOFF_BASE_SECS * 2f64.powi(attempt.min(30) as i32);
        Duration::from_secs_f64(secs).min(self.wait_cap)
    }
}

pub struct OpExecutor {
    request_type: &'static str,
    db_system: &'static str,
    retry: RetryPolicy,
    sink: Arc<dyn StatsSink>,
    metrics: Option<Arc<OpMetrics>>,
}

impl OpExecutor {
    pub fn new(
        kind: CacheKind,
        retry: RetryPolicy,
        sink: Arc<dyn StatsSink>,
        metrics: Option<Arc<OpMetrics>>,
    ) -> Self {
        OpExecutor {
            request_type: kind.request_type(),
            db_system: kind.db_system(),
            retry,
            sink,
            metrics,
        }
    }

    /// GET with retry. Returns the value, or `None` for a miss or a failure
    /// that survived all retries.
    pub async fn timed_get(
        &self,
        client: &dyn CacheClient,
        key: &str,
        scenario: &str,
    ) -> Option<String> {
        let statement = format!("GET {}", key);
        let span = tracing::info_span!(
            "cache.get",
            otel.name = "GET",
            otel.kind = "client",
            db.system = self.db_system,
            db.statement = %statement,
            otel.status_code = tracing::field::Empty,
        );
        let start = Instant::now();
        let result = self
            .retrying(|| client.get(key))
            .instrument(span.clone())
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let name = format!("get_value_{}", scenario);
        match result {
            Ok(value) => {
                let len = value.as_ref().map(|v| v.len()).unwrap_or(0);
                self.emit("GET", scenario, name, elapsed_ms, len, None);
                value
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                error!(parent: &span, error = %e, key, "Error during cache get");
                self.emit("GET", scenario, name, elapsed_ms, 0, Some(e));
                None
            }
        }
    }

    /// SET with retry. Returns whether the write succeeded.
    pub async fn timed_set(
        &self,
        client: &dyn CacheClient,
        key: &str,
        value: &str,
        ttl_secs: u64,
        scenario: &str,
    ) -> bool {
        let statement = format!("SET {}", key);
        let span = tracing::info_span!(
            "cache.set",
            otel.name = "SET",
            otel.kind = "client",
            db.system = self.db_system,
            db.statement = %statement,
            otel.status_code = tracing::field::Empty,
        );
        let start = Instant::now();
        let result = self
            .retrying(|| client.set(key, value, ttl_secs))
            .instrument(span.clone())
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let name = format!("set_value_{}", scenario);
        match result {
            Ok(()) => {
                self.emit("SET", scenario, name, elapsed_ms, 0, None);
                true
            }
            Err(e) => {
                span.record("otel.status_code", "ERROR");
                error!(parent: &span, error = %e, key, "Error during cache set");
                self.emit("SET", scenario, name, elapsed_ms, 0, Some(e));
                false
            }
        }
    }

    /// Sequential bounded retry. Only transient kinds re-attempt; the final
    /// failure (or any terminal one) is returned as-is.
    async fn retrying<T, F, Fut>(&self, op: F) -> ClientResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.attempts => {
                    debug!(error = %e, attempt = attempt + 1, "transient cache error, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn emit(
        &self,
        op: &'static str,
        scenario: &str,
        name: String,
        elapsed_ms: f64,
        response_length: usize,
        error: Option<ClientError>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record(op, scenario, self.db_system, elapsed_ms, error.is_some());
        }
        self.sink.fire(RequestOutcome {
            request_type: self.request_type,
            name,
            response_time_ms: elapsed_ms,
            response_length,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type GetScript = VecDeque<ClientResult<Option<String>>>;
    type SetScript = VecDeque<ClientResult<()>>;

    /// Client that plays back scripted results and counts calls.
    struct ScriptedClient {
        gets: Mutex<GetScript>,
        sets: Mutex<SetScript>,
        get_calls: AtomicUsize,
        set_calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(gets: Vec<ClientResult<Option<String>>>, sets: Vec<ClientResult<()>>) -> Self {
            ScriptedClient {
                gets: Mutex::new(gets.into()),
                sets: Mutex::new(sets.into()),
                get_calls: AtomicUsize::new(0),
                set_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CacheClient for ScriptedClient {
        async fn get(&self, _key: &str) -> ClientResult<Option<String>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.gets.lock().pop_front().unwrap_or(Ok(None))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl_secs: u64) -> ClientResult<()> {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            self.sets.lock().pop_front().unwrap_or(Ok(()))
        }
        async fn ping(&self) -> ClientResult<()> {
            Ok(())
        }
        async fn close(&self) -> ClientResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        outcomes: Mutex<Vec<RequestOutcome>>,
    }

    impl StatsSink for CaptureSink {
        fn fire(&self, outcome: RequestOutcome) {
            self.outcomes.lock().push(outcome);
        }
    }

    fn executor(attempts: u32, sink: Arc<CaptureSink>) -> OpExecutor {
        OpExecutor::new(
            CacheKind::RedisCluster,
            RetryPolicy {
                attempts,
                wait_cap: Duration::from_secs(2),
            },
            sink,
            None,
        )
    }

    fn transient() -> ClientError {
        ClientError::Connection("reset by peer".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            wait_cap: Duration::from_secs(2),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_masked_by_success() {
        let sink = Arc::new(CaptureSink::default());
        let client = ScriptedClient::new(
            vec![Err(transient()), Err(transient()), Ok(Some("v".into()))],
            vec![],
        );
        let exec = executor(3, sink.clone());

        let value = exec.timed_get(&client, "key_1", "default").await;
        assert_eq!(value, Some("v".into()));
        assert_eq!(client.get_calls.load(Ordering::SeqCst), 3);

        let outcomes = sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.is_none());
        assert_eq!(outcomes[0].name, "get_value_default");
        assert_eq!(outcomes[0].response_length, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_reports_the_last_error() {
        let sink = Arc::new(CaptureSink::default());
        let client = ScriptedClient::new(
            vec![
                Err(transient()),
                Err(transient()),
                Err(ClientError::Timeout("final".into())),
            ],
            vec![],
        );
        let exec = executor(3, sink.clone());

        let value = exec.timed_get(&client, "key_1", "default").await;
        assert_eq!(value, None);
        assert_eq!(client.get_calls.load(Ordering::SeqCst), 3);

        let outcomes = sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].error {
            Some(ClientError::Timeout(msg)) => assert_eq!(msg, "final"),
            other => panic!("expected the last attempt's error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_do_not_retry() {
        let sink = Arc::new(CaptureSink::default());
        let client = ScriptedClient::new(
            vec![Err(ClientError::Operation("WRONGTYPE".into()))],
            vec![],
        );
        let exec = executor(3, sink.clone());

        let value = exec.timed_get(&client, "key_1", "default").await;
        assert_eq!(value, None);
        assert_eq!(client.get_calls.load(Ordering::SeqCst), 1);
        assert!(sink.outcomes.lock()[0].error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn set_emits_its_own_outcome() {
        let sink = Arc::new(CaptureSink::default());
        let client = ScriptedClient::new(vec![], vec![Err(transient()), Ok(())]);
        let exec = executor(3, sink.clone());

        let ok = exec.timed_set(&client, "key_1", "AAAA", 60, "dummy").await;
        assert!(ok);
        assert_eq!(client.set_calls.load(Ordering::SeqCst), 2);

        let outcomes = sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].name, "set_value_dummy");
        assert!(outcomes[0].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_miss_is_a_clean_outcome() {
        let sink = Arc::new(CaptureSink::default());
        let client = ScriptedClient::new(vec![Ok(None)], vec![]);
        let exec = executor(3, sink.clone());

        let value = exec.timed_get(&client, "missing", "dummy").await;
        assert_eq!(value, None);
        let outcomes = sink.outcomes.lock();
        assert!(outcomes[0].error.is_none());
        assert_eq!(outcomes[0].response_length, 0);
    }
}
