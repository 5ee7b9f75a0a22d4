//! Cache and invalidation metrics.
//!
//! Recorded through the `metrics` facade. The library never installs a
//! recorder, so these calls are no-ops until the host process installs one
//! (the relay binary can install the Prometheus exporter).

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    // Item API
    pub const CACHE_HITS_TOTAL: &str = "tiercache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const CACHE_MULTIGET_HITS_TOTAL: &str = "tiercache_multiget_hits_total";
    pub const CACHE_MULTIGET_MISSES_TOTAL: &str = "tiercache_multiget_misses_total";

    // Invalidation
    pub const INVALIDATION_MESSAGES_TOTAL: &str = "tiercache_invalidation_messages_total";
    pub const INVALIDATION_KEYS: &str = "tiercache_invalidation_keys";
    pub const INVALIDATION_LATENCY_SECONDS: &str = "tiercache_invalidation_latency_seconds";
}

// =============================================================================
// Item API
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(cache: &str) {
    counter!(names::CACHE_HITS_TOTAL, "cache" => cache.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss(cache: &str) {
    counter!(names::CACHE_MISSES_TOTAL, "cache" => cache.to_string()).increment(1);
}

/// Record the outcome of a multi-key read.
pub fn record_multiget(cache: &str, hits: usize, misses: usize) {
    if hits > 0 {
        counter!(names::CACHE_MULTIGET_HITS_TOTAL, "cache" => cache.to_string())
            .increment(hits as u64);
    }
    if misses > 0 {
        counter!(names::CACHE_MULTIGET_MISSES_TOTAL, "cache" => cache.to_string())
            .increment(misses as u64);
    }
}

// =============================================================================
// Invalidation
// =============================================================================

/// Record a processed invalidation message.
pub fn record_invalidation(cache: &str, source_region: &str, keys: usize, latency: Duration) {
    counter!(
        names::INVALIDATION_MESSAGES_TOTAL,
        "cache" => cache.to_string(),
        "region" => source_region.to_string()
    )
    .increment(1);

    histogram!(
        names::INVALIDATION_KEYS,
        "cache" => cache.to_string(),
        "region" => source_region.to_string()
    )
    .record(keys as f64);

    histogram!(
        names::INVALIDATION_LATENCY_SECONDS,
        "cache" => cache.to_string(),
        "region" => source_region.to_string()
    )
    .record(latency.as_secs_f64());
}
