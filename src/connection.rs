//! Reference-counted shared backend connection.
//!
//! All simulated users in a process share one physical connection. The
//! first `acquire` builds it, the last `release` closes it. Construction
//! and teardown both happen under one async mutex: construction is a
//! network call and therefore a suspension point, so racing creators must
//! be serialized explicitly.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::client::{CacheClient, ClientFactory};
use crate::error::ErrorKind;

struct ConnState {
    handle: Option<Arc<dyn CacheClient>>,
    users: usize,
}

pub struct SharedConnection {
    factory: Arc<dyn ClientFactory>,
    state: Mutex<ConnState>,
}

impl SharedConnection {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        SharedConnection {
            factory,
            state: Mutex::new(ConnState {
                handle: None,
                users: 0,
            }),
        }
    }

    /// Take a reference to the shared connection, constructing it if no
    /// live handle exists. Returns `None` when construction fails; the
    /// caller must abstain from issuing operations for this cycle. A failed
    /// construction takes no reference, so the count only ever tracks live
    /// handles, and the next `acquire` re-attempts.
    pub async fn acquire(&self) -> Option<Arc<dyn CacheClient>> {
        let mut state = self.state.lock().await;
        if state.handle.is_none() {
            match self.factory.connect().await {
                Ok(client) => {
                    state.handle = Some(client);
                }
                Err(e) => {
                    match e.kind() {
                        ErrorKind::ClusterUnavailable => {
                            error!(error = %e, "Cluster is down during connection initialization")
                        }
                        ErrorKind::Timeout => {
                            error!(error = %e, "Timeout during connection initialization")
                        }
                        ErrorKind::Connection => error!(error = %e, "Connection error"),
                        ErrorKind::Other => {
                            error!(error = %e, "Unexpected error during connection initialization")
                        }
                    }
                    return None;
                }
            }
        }
        state.users += 1;
        state.handle.clone()
    }

    /// Drop one reference. When the count reaches zero the underlying
    /// handle is closed and discarded; close errors are logged, never
    /// propagated.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.users == 0 {
            warn!("release called with no outstanding references");
            return;
        }
        state.users -= 1;
        if state.users == 0 {
            if let Some(client) = state.handle.take() {
                match client.close().await {
                    Ok(()) => info!("Shared cache connection closed"),
                    Err(e) => warn!(error = %e, "Error closing shared cache connection"),
                }
            }
        }
    }

    /// Number of outstanding references.
    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users
    }

    /// Whether a live handle currently exists.
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, ClientResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CacheClient for CountingClient {
        async fn get(&self, _key: &str) -> ClientResult<Option<String>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: &str, _ttl_secs: u64) -> ClientResult<()> {
            Ok(())
        }
        async fn ping(&self) -> ClientResult<()> {
            Ok(())
        }
        async fn close(&self) -> ClientResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn connect(&self) -> ClientResult<Arc<dyn CacheClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ClientError::Connection("refused".into()));
            }
            Ok(Arc::new(CountingClient {
                closes: self.closes.clone(),
            }))
        }
    }

    fn counting(fail: bool) -> (Arc<SharedConnection>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = Arc::new(SharedConnection::new(Arc::new(CountingFactory {
            connects: connects.clone(),
            closes: closes.clone(),
            fail,
        })));
        (conn, connects, closes)
    }

    #[tokio::test]
    async fn single_user_lifecycle() {
        let (conn, connects, closes) = counting(false);
        let handle = conn.acquire().await;
        assert!(handle.is_some());
        assert_eq!(conn.user_count().await, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        conn.release().await;
        assert_eq!(conn.user_count().await, 0);
        assert!(!conn.is_connected().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn twenty_concurrent_users_share_one_connection() {
        let (conn, connects, closes) = counting(false);
        let barrier = Arc::new(tokio::sync::Barrier::new(20));
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let conn = conn.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                let handle = conn.acquire().await;
                assert!(handle.is_some());
                // All twenty hold a reference before anyone releases.
                barrier.wait().await;
                conn.release().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.user_count().await, 0);
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn construction_failure_yields_none_and_takes_no_reference() {
        let (conn, connects, _closes) = counting(true);
        assert!(conn.acquire().await.is_none());
        assert!(conn.acquire().await.is_none());
        assert_eq!(conn.user_count().await, 0);
        // Each acquire re-attempts construction.
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_without_acquire_never_goes_negative() {
        let (conn, _, closes) = counting(false);
        conn.release().await;
        assert_eq!(conn.user_count().await, 0);

        let _handle = conn.acquire().await.unwrap();
        conn.release().await;
        conn.release().await;
        assert_eq!(conn.user_count().await, 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
