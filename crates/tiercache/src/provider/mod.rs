//! Backend provider contract.
//!
//! Every backend implements the same conditional-write protocol so that the
//! wrappers ([`LayeringWrapper`](crate::LayeringWrapper),
//! [`InvalidationWrapper`](crate::InvalidationWrapper)) and the
//! [`Manager`](crate::Manager) can be stacked over any of them.
//!
//! ## Slot lifecycle
//!
//! ```text
//! Empty ──write_sentinel──▶ Locked(sentinel) ──set_value──▶ Valued
//!                                  │                         Empty
//!                                  └─────────────────────▶  Tombstoned
//! ```
//!
//! Transitions out of `Locked` are decided by the provider's
//! [`SentinelManager`](crate::SentinelManager).

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::key::{Key, RateLimitKey, Sentinel, SentinelType};

/// Maximum number of keys accepted by a single `add_dependency` call.
pub const MAX_DEPENDENCY_KEYS: usize = 500;

/// Callback run when a registered key is invalidated by another cache.
///
/// The flag is `true` when the invalidation was a prefix flush.
pub type InvalidationHandler =
    Arc<dyn Fn(Key, bool) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Result of reading one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheLookup {
    /// Stored value, `None` on a miss.
    pub value: Option<String>,
    /// Sentinel or tombstone found in the slot instead of a value.
    pub conflict: Option<String>,
    /// Read lock taken on a miss, [`Sentinel::NO_LOCK`] otherwise.
    pub sentinel: Sentinel,
    /// The value came from the outer layer of a layered cache.
    pub partial_hit: bool,
}

impl CacheLookup {
    pub fn hit(value: String) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn is_hit(&self) -> bool {
        self.value.is_some()
    }
}

/// Result of a conditional `set_value`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOutcome {
    pub set: bool,
    pub conflict: bool,
}

impl SetOutcome {
    pub const SET: SetOutcome = SetOutcome {
        set: true,
        conflict: false,
    };
    pub const NOT_SET: SetOutcome = SetOutcome {
        set: false,
        conflict: false,
    };
    pub const CONFLICT: SetOutcome = SetOutcome {
        set: false,
        conflict: true,
    };
}

/// Result of a rate-limit reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitReservation {
    pub reserved: bool,
    pub total_slots: i64,
}

/// The storage boundary of the cache.
///
/// All methods are safe to call concurrently from many tasks and processes.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Reads one key, taking a read lock on a miss when `lock_on_miss` is set.
    async fn get_value(&self, key: &Key, lock_on_miss: bool) -> Result<CacheLookup>;

    /// Batch version of [`get_value`](Provider::get_value).
    ///
    /// `lock_on_miss` must have one entry per key.
    async fn get_values(&self, keys: &[Key], lock_on_miss: &[bool]) -> Result<Vec<CacheLookup>>;

    /// Stores `value` under every key in `keys` if `lock_key` still holds
    /// `sentinel`.
    async fn set_value(
        &self,
        lock_key: &Key,
        keys: &[Key],
        value: &str,
        sentinel: &Sentinel,
        ttl: Duration,
    ) -> Result<SetOutcome>;

    /// Deletes (or tombstones) keys. Without `force`, keys holding a sentinel
    /// are left alone.
    async fn delete_value(&self, keys: &[Key], set_tombstone: bool, force: bool) -> Result<()>;

    /// Takes a lock on `keys`. The first key is the primary key.
    async fn write_sentinel(&self, stype: SentinelType, keys: &[Key]) -> Result<Sentinel>;

    /// Clears the keys that still hold `sentinel`.
    async fn release_sentinel(&self, keys: &[Key], sentinel: &Sentinel);

    /// Adds `values` to the dependency set stored under each of `keys`.
    async fn add_dependency(&self, keys: &[Key], values: &[Key], ttl: Duration) -> Result<()>;

    /// Deletes every key in the dependency set, then the set itself.
    async fn clear_dependencies(&self, key: &Key, set_tombstone: bool) -> Result<()>;

    /// Deletes every key starting with `prefix`.
    async fn flush(&self, prefix: &str, flush_tombstones: bool) -> Result<()>;

    fn cache_name(&self) -> &str;

    async fn register_invalidation_handler(
        &self,
        handler: InvalidationHandler,
        key: Key,
    ) -> Result<()>;

    /// Logs every key starting with `prefix` together with its value.
    async fn log_key_values(&self, prefix: &str) -> Result<()>;

    /// Whether this provider is a two-tier cache.
    fn layered(&self) -> bool {
        false
    }

    fn supports_rate_limits(&self) -> bool {
        false
    }

    /// Reserves a slot across the buckets in `keys`.
    ///
    /// Providers without rate-limit support always grant the slot.
    async fn reserve_rate_limit_slot(
        &self,
        _keys: &[RateLimitKey],
        _limit: i64,
        _ttl: Duration,
        _take_slot: bool,
    ) -> Result<RateLimitReservation> {
        Ok(RateLimitReservation {
            reserved: true,
            total_slots: 1,
        })
    }

    /// Gives back one slot, oldest bucket first, and returns the new total.
    async fn release_rate_limit_slot(&self, _keys: &[RateLimitKey]) -> Result<i64> {
        Ok(0)
    }

    /// Stops any background work owned by the provider.
    async fn shutdown(&self) {}
}

/// Shared argument check for `get_values`.
pub(crate) fn check_get_values_args(keys: &[Key], lock_on_miss: &[bool]) -> Result<()> {
    if keys.len() != lock_on_miss.len() {
        return Err(crate::CacheError::invalid_argument(format!(
            "Number of keys provided to GetValues has to be equal to number of lockOnMiss: {} != {}",
            keys.len(),
            lock_on_miss.len()
        )));
    }
    if keys.iter().any(Key::is_empty) {
        return Err(crate::CacheError::invalid_argument(
            "GetValues was called with a blank key",
        ));
    }
    Ok(())
}

/// Shared argument check for `add_dependency`. Returns the non-blank values.
pub(crate) fn check_add_dependency_args<'a>(keys: &[Key], values: &'a [Key]) -> Result<Vec<&'a Key>> {
    if keys.is_empty() {
        return Err(crate::CacheError::invalid_argument(
            "AddDependency called with no keys",
        ));
    }
    if keys.len() > MAX_DEPENDENCY_KEYS {
        return Err(crate::CacheError::invalid_argument(format!(
            "AddDependency called with {} keys, maximum is {MAX_DEPENDENCY_KEYS}",
            keys.len()
        )));
    }
    let values: Vec<&Key> = values.iter().filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return Err(crate::CacheError::invalid_argument(
            "AddDependency called with no values",
        ));
    }
    Ok(values)
}
