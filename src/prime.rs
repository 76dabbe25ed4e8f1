//! Cache priming for the hit-path key space.
//!
//! `init` mode connects once, walks `key_1..key_{set_keys}`, and writes any
//! key that is absent. Existing keys are left alone so re-priming a warm
//! cache is cheap and does not reset TTLs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::config::ResolvedConfig;
use crate::error::Result;
use crate::traffic::generate_value;

pub async fn prime_cache(config: &ResolvedConfig, factory: Arc<dyn ClientFactory>) -> Result<()> {
    let client = factory.connect().await?;
    info!("Populating cache with {} keys...", config.set_keys);

    let value = generate_value(config.value_size_kb);
    let mut written = 0u64;
    for i in 1..=config.set_keys {
        let key = format!("key_{}", i);
        if client.get(&key).await?.is_some() {
            debug!(key, "key already present, skipping");
        } else {
            client.set(&key, &value, config.ttl_secs).await?;
            written += 1;
        }
    }

    info!(
        "Cache primed: {} keys written, {} already present",
        written,
        config.set_keys - written
    );
    if let Err(e) = client.close().await {
        warn!(error = %e, "error closing cache connection after priming");
    }
    Ok(())
}
