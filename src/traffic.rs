//! Traffic mix policy.
//!
//! One call to [`cache_scenario`] is one simulated request. A uniform draw
//! against the configured hit rate picks the hit path (bounded key space,
//! warm-cache latency) or the miss path (always-novel key, cold-cache
//! latency). A GET that comes back empty is repaired with a SET either way;
//! an exhausted-retry GET is treated exactly like a true miss, so the hit
//! rate measures "requests that found a value", not backend health.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::client::CacheClient;
use crate::runner::RunContext;

/// Uniform key from the bounded hit-path key space, `key_1..key_{set_keys}`.
pub fn hit_key(rng: &mut impl Rng, set_keys: u64) -> String {
    format!("key_{}", rng.gen_range(1..=set_keys))
}

/// Guaranteed-novel key: sha256 of the nanosecond unix timestamp. Exists to
/// produce guaranteed cache misses for baseline latency measurement.
pub fn miss_key() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let digest = Sha256::digest(nanos.to_string().as_bytes());
    format!("{:x}", digest)
}

/// The payload written on every SET: `value_size` KB of repeated `A`.
pub fn generate_value(size_kb: usize) -> String {
    "A".repeat(size_kb * 1024)
}

/// One simulated request. Increments `total_requests` exactly once on every
/// branch; increments `cache_hits` iff the hit-path GET found a value. With
/// no connection available the user abstains for this cycle.
pub async fn cache_scenario(
    ctx: &RunContext,
    client: Option<&dyn CacheClient>,
    rng: &mut impl Rng,
) {
    ctx.counters.increment_total();

    let Some(client) = client else {
        warn!("cache connection not available");
        return;
    };

    if rng.gen::<f64>() < ctx.config.hit_rate {
        let key = hit_key(rng, ctx.config.set_keys);
        let result = ctx.executor.timed_get(client, &key, "default").await;
        if result.is_some() {
            ctx.counters.increment_hit();
        } else {
            // Repair the miss; the SET outcome is recorded independently
            // and never converts the GET into a hit.
            let value = generate_value(ctx.config.value_size_kb);
            ctx.executor
                .timed_set(client, &key, &value, ctx.config.ttl_secs, "default")
                .await;
        }
    } else {
        let key = miss_key();
        let result = ctx.executor.timed_get(client, &key, "dummy").await;
        if result.is_none() {
            let value = generate_value(ctx.config.value_size_kb);
            ctx.executor
                .timed_set(client, &key, &value, ctx.config.ttl_secs, "dummy")
                .await;
        }
    }
}
