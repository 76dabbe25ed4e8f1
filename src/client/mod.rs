//! Cache client seam.
//!
//! Everything above this module talks to the backend through [`CacheClient`]
//! and builds connections through [`ClientFactory`]. The two adapters cover
//! standalone and clustered deployments; Redis and Valkey speak the same
//! wire protocol, so the protocol family only affects reported labels.
//! Native `redis` errors are mapped into [`ErrorKind`]s here and nowhere
//! else.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ResolvedConfig;
use crate::error::{ClientError, ClientResult};

pub mod cluster_adapter;
pub mod standalone_adapter;

pub use cluster_adapter::ClusterClient;
pub use standalone_adapter::StandaloneClient;

/// Operations the harness needs from a backend connection. Implementations
/// must be safe for concurrent use by many cooperative callers.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// GET key. `None` means the key is absent.
    async fn get(&self, key: &str) -> ClientResult<Option<String>>;

    /// SET key value EX ttl.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> ClientResult<()>;

    /// PING, used to verify a fresh connection.
    async fn ping(&self) -> ClientResult<()>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> ClientResult<()>;
}

/// Builds a [`CacheClient`] for the configured backend. Production
/// factories read [`ResolvedConfig`]; tests inject scripted ones.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self) -> ClientResult<Arc<dyn CacheClient>>;
}

/// Select the factory matching the configured backend topology.
pub fn factory_for(config: &ResolvedConfig) -> Arc<dyn ClientFactory> {
    if config.cache_kind.is_cluster() {
        Arc::new(ClusterFactory::new(config.clone()))
    } else {
        Arc::new(StandaloneFactory::new(config.clone()))
    }
}

pub struct StandaloneFactory {
    config: ResolvedConfig,
}

impl StandaloneFactory {
    pub fn new(config: ResolvedConfig) -> Self {
        StandaloneFactory { config }
    }
}

#[async_trait]
impl ClientFactory for StandaloneFactory {
    async fn connect(&self) -> ClientResult<Arc<dyn CacheClient>> {
        let client = StandaloneClient::connect(&self.config).await?;
        Ok(Arc::new(client))
    }
}

pub struct ClusterFactory {
    config: ResolvedConfig,
}

impl ClusterFactory {
    pub fn new(config: ResolvedConfig) -> Self {
        ClusterFactory { config }
    }
}

#[async_trait]
impl ClientFactory for ClusterFactory {
    async fn connect(&self) -> ClientResult<Arc<dyn CacheClient>> {
        let client = ClusterClient::connect(&self.config).await?;
        Ok(Arc::new(client))
    }
}

/// Map a native `redis` error into the harness taxonomy. The retry layer
/// only ever inspects the resulting [`ErrorKind`].
///
/// [`ErrorKind`]: crate::error::ErrorKind
pub(crate) fn translate_error(e: &redis::RedisError) -> ClientError {
    use redis::ErrorKind as K;
    match e.kind() {
        K::ClusterDown | K::TryAgain | K::MasterDown => {
            ClientError::ClusterUnavailable(e.to_string())
        }
        _ if e.is_timeout() => ClientError::Timeout(e.to_string()),
        K::IoError => ClientError::Connection(e.to_string()),
        _ if e.is_connection_refusal() || e.is_connection_dropped() => {
            ClientError::Connection(e.to_string())
        }
        _ => ClientError::Operation(e.to_string()),
    }
}

/// Enforce the per-operation query timeout on a redis future.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> ClientResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(translate_error(&e)),
        Err(_) => Err(ClientError::Timeout(format!(
            "operation did not complete within {}s",
            limit.as_secs()
        ))),
    }
}
