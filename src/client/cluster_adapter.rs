//! Cluster adapter over the async `redis` cluster connection.

use std::time::Duration;

use async_trait::async_trait;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use tracing::{info, warn};

use super::{translate_error, with_timeout, CacheClient};
use crate::config::ResolvedConfig;
use crate::error::ClientResult;

/// A connection to a Redis or Valkey cluster. Topology discovery and slot
/// routing live in the `redis` crate; the connection handle is cheap to
/// clone and safe to share across tasks.
pub struct ClusterClient {
    conn: ClusterConnection,
    timeout: Duration,
}

impl ClusterClient {
    pub async fn connect(config: &ResolvedConfig) -> ClientResult<Self> {
        let family = config.cache_kind.db_system();
        info!(
            "Creating {} cluster connection with pool size: {}",
            family, config.connections_pool
        );
        info!(
            "Connecting to {} cluster at {}:{} SSL={}",
            family, config.cache_host, config.cache_port, config.ssl
        );

        if config.ssl && config.ssl_ca_certs.is_some() {
            warn!("custom CA bundles are not supported for cluster connections; ignoring ssl_ca_certs");
        }

        let client = ClusterClientBuilder::new(vec![config.connection_url()])
            .retries(config.retry_attempts)
            .connection_timeout(config.query_timeout())
            .build()
            .map_err(|e| translate_error(&e))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| translate_error(&e))?;
        info!("{} cluster connection established successfully", family);
        Ok(ClusterClient {
            conn,
            timeout: config.query_timeout(),
        })
    }
}

#[async_trait]
impl CacheClient for ClusterClient {
    async fn get(&self, key: &str) -> ClientResult<Option<String>> {
        let mut conn = self.conn.clone();
        with_timeout(self.timeout, redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> ClientResult<()> {
        let mut conn = self.conn.clone();
        with_timeout(
            self.timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn ping(&self) -> ClientResult<()> {
        let mut conn = self.conn.clone();
        with_timeout(
            self.timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }

    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}
