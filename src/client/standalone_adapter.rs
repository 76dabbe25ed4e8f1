//! Standalone adapter over a `redis` connection manager.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ClientTlsConfig, TlsCertificates};
use tracing::info;

use super::{translate_error, with_timeout, CacheClient};
use crate::config::ResolvedConfig;
use crate::error::{ClientError, ClientResult};

/// A single multiplexed connection to a standalone Redis or Valkey server.
/// Cloning the inner manager is cheap; every operation works on a clone so
/// the adapter itself can be shared behind `&self`.
pub struct StandaloneClient {
    manager: ConnectionManager,
    timeout: Duration,
}

impl StandaloneClient {
    pub async fn connect(config: &ResolvedConfig) -> ClientResult<Self> {
        let family = config.cache_kind.db_system();
        info!(
            "Creating {} standalone connection with pool size: {}",
            family, config.connections_pool
        );
        info!(
            "Connecting to {} standalone at {}:{} SSL={}",
            family, config.cache_host, config.cache_port, config.ssl
        );

        let url = config.connection_url();
        let client = match (&config.ssl_ca_certs, config.ssl) {
            (Some(path), true) => {
                let root_cert = std::fs::read(path).map_err(|e| {
                    ClientError::Connection(format!("cannot read CA bundle {}: {}", path, e))
                })?;
                Client::build_with_tls(
                    url,
                    TlsCertificates {
                        client_tls: None::<ClientTlsConfig>,
                        root_cert: Some(root_cert),
                    },
                )
            }
            _ => Client::open(url),
        }
        .map_err(|e| translate_error(&e))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| translate_error(&e))?;
        let adapter = StandaloneClient {
            manager,
            timeout: config.query_timeout(),
        };
        // Verify the connection before handing it out, like a PING on connect.
        adapter.ping().await?;
        info!("{} standalone connection established successfully", family);
        Ok(adapter)
    }
}

#[async_trait]
impl CacheClient for StandaloneClient {
    async fn get(&self, key: &str) -> ClientResult<Option<String>> {
        let mut conn = self.manager.clone();
        with_timeout(self.timeout, redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> ClientResult<()> {
        let mut conn = self.manager.clone();
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
        let mut conn = self.manager.clone();
        with_timeout(
            self.timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }

    async fn close(&self) -> ClientResult<()> {
        // The manager tears down its connection on drop; nothing to flush.
        Ok(())
    }
}
