//! Two-tier cache.
//!
//! The inner provider sits next to the consumer (usually in-process), the
//! outer one is shared (usually Redis). Reads go inner first and backfill it
//! from outer hits. Writes go outer first so the shared tier is never behind
//! the local one. Sentinels taken in both tiers travel as one combined
//! `inner#outer` string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::key::{Key, RateLimitKey, Sentinel, SentinelType, is_tombstone};
use crate::provider::{CacheLookup, InvalidationHandler, Provider, RateLimitReservation, SetOutcome};

/// Separator between the inner and outer halves of a combined sentinel.
pub const SENTINEL_SEPARATOR: char = '#';

/// TTL of values copied from the outer tier into the inner one.
pub const BACKFILL_TTL: Duration = Duration::from_secs(60);

fn combine_sentinels(inner: &str, outer: &str) -> String {
    if inner.is_empty() && outer.is_empty() {
        return String::new();
    }
    format!("{inner}{SENTINEL_SEPARATOR}{outer}")
}

fn split_sentinel(sentinel: &Sentinel) -> (Sentinel, Sentinel) {
    match sentinel.as_str().split_once(SENTINEL_SEPARATOR) {
        Some((inner, outer)) => (Sentinel::from(inner), Sentinel::from(outer)),
        None => (sentinel.clone(), Sentinel::NO_LOCK),
    }
}

fn combine_conflicts(inner: Option<&str>, outer: Option<&str>) -> Option<String> {
    if inner.is_none() && outer.is_none() {
        return None;
    }
    let inner = inner.unwrap_or_default();
    let outer = outer.unwrap_or_default();
    if is_tombstone(inner) && is_tombstone(outer) {
        return Some(outer.to_string());
    }
    Some(combine_sentinels(inner, outer))
}

/// Provider stacking an inner cache over an outer one.
pub struct LayeringWrapper {
    inner: Arc<dyn Provider>,
    outer: Arc<dyn Provider>,
    name: String,
}

impl LayeringWrapper {
    pub fn new(inner: Arc<dyn Provider>, outer: Arc<dyn Provider>) -> Self {
        let name = format!("Layered[{},{}]", inner.cache_name(), outer.cache_name());
        Self { inner, outer, name }
    }

    fn rate_limit_layer(&self) -> &Arc<dyn Provider> {
        if !self.inner.supports_rate_limits() && self.outer.supports_rate_limits() {
            &self.outer
        } else {
            &self.inner
        }
    }

    /// Folds an inner miss and the matching outer lookup into one result.
    async fn merge_miss(&self, key: &Key, inner: CacheLookup, outer: CacheLookup) -> CacheLookup {
        let mut inner_sentinel = inner.sentinel;
        if !inner_sentinel.is_no_lock() && outer.sentinel.is_no_lock() {
            self.inner
                .release_sentinel(std::slice::from_ref(key), &inner_sentinel)
                .await;
            inner_sentinel = Sentinel::NO_LOCK;
        }
        let sentinel = if inner_sentinel.is_no_lock() {
            Sentinel::NO_LOCK
        } else {
            Sentinel::from(combine_sentinels(inner_sentinel.as_str(), outer.sentinel.as_str()))
        };
        CacheLookup {
            value: None,
            conflict: combine_conflicts(inner.conflict.as_deref(), outer.conflict.as_deref()),
            sentinel,
            partial_hit: false,
        }
    }
}

#[async_trait]
impl Provider for LayeringWrapper {
    async fn get_value(&self, key: &Key, lock_on_miss: bool) -> Result<CacheLookup> {
        let inner = self.inner.get_value(key, lock_on_miss).await?;
        if inner.is_hit() {
            return Ok(inner);
        }

        let lock_outer = lock_on_miss && !inner.sentinel.is_no_lock();
        let outer = self.outer.get_value(key, lock_outer).await?;
        if let Some(value) = outer.value {
            if !inner.sentinel.is_no_lock() {
                self.inner
                    .set_value(key, std::slice::from_ref(key), &value, &inner.sentinel, BACKFILL_TTL)
                    .await?;
            }
            return Ok(CacheLookup {
                value: Some(value),
                conflict: outer.conflict,
                sentinel: outer.sentinel,
                partial_hit: true,
            });
        }

        Ok(self.merge_miss(key, inner, outer).await)
    }

    async fn get_values(&self, keys: &[Key], lock_on_miss: &[bool]) -> Result<Vec<CacheLookup>> {
        let mut results = self.inner.get_values(keys, lock_on_miss).await?;
        let missed: Vec<usize> = (0..results.len()).filter(|&i| !results[i].is_hit()).collect();
        if missed.is_empty() {
            debug!(cache = %self.name, keys = ?keys, "all keys served by inner cache");
            return Ok(results);
        }

        let missed_keys: Vec<Key> = missed.iter().map(|&i| keys[i].clone()).collect();
        let missed_locks: Vec<bool> = missed
            .iter()
            .map(|&i| lock_on_miss[i] && !results[i].sentinel.is_no_lock())
            .collect();
        let outer = self.outer.get_values(&missed_keys, &missed_locks).await?;

        for (&i, outer) in missed.iter().zip(outer) {
            let inner = std::mem::take(&mut results[i]);
            results[i] = match outer.value {
                Some(value) => {
                    if !inner.sentinel.is_no_lock() {
                        let key = &keys[i];
                        if let Err(e) = self
                            .inner
                            .set_value(key, std::slice::from_ref(key), &value, &inner.sentinel, BACKFILL_TTL)
                            .await
                        {
                            debug!(cache = %self.name, key = %key, error = %e, "inner backfill failed");
                        }
                    }
                    CacheLookup {
                        value: Some(value),
                        conflict: outer.conflict,
                        sentinel: outer.sentinel,
                        partial_hit: true,
                    }
                }
                None => self.merge_miss(&keys[i], inner, outer).await,
            };
        }
        Ok(results)
    }

    async fn set_value(
        &self,
        lock_key: &Key,
        keys: &[Key],
        value: &str,
        sentinel: &Sentinel,
        ttl: Duration,
    ) -> Result<SetOutcome> {
        let (inner_sentinel, outer_sentinel) = split_sentinel(sentinel);
        if inner_sentinel.is_no_lock() || outer_sentinel.is_no_lock() {
            return Ok(SetOutcome::CONFLICT);
        }

        let outer = self
            .outer
            .set_value(lock_key, keys, value, &outer_sentinel, ttl)
            .await?;
        if !outer.set {
            return Ok(SetOutcome {
                set: false,
                conflict: outer.conflict,
            });
        }

        let inner = self
            .inner
            .set_value(lock_key, keys, value, &inner_sentinel, ttl)
            .await?;
        if !inner.set || inner.conflict {
            debug!(cache = %self.name, key = %lock_key, "value set in outer cache but not in inner cache");
            return Ok(SetOutcome {
                set: false,
                conflict: inner.conflict,
            });
        }
        Ok(SetOutcome::SET)
    }

    async fn delete_value(&self, keys: &[Key], set_tombstone: bool, force: bool) -> Result<()> {
        self.outer.delete_value(keys, set_tombstone, force).await?;
        self.inner.delete_value(keys, set_tombstone, force).await
    }

    async fn write_sentinel(&self, stype: SentinelType, keys: &[Key]) -> Result<Sentinel> {
        let inner = self.inner.write_sentinel(stype, keys).await?;
        if inner.is_no_lock() {
            return Ok(Sentinel::NO_LOCK);
        }
        let outer = match self.outer.write_sentinel(stype, keys).await {
            Ok(outer) => outer,
            Err(e) => {
                self.inner.release_sentinel(keys, &inner).await;
                return Err(e);
            }
        };
        if outer.is_no_lock() {
            self.inner.release_sentinel(keys, &inner).await;
            return Ok(Sentinel::NO_LOCK);
        }
        Ok(Sentinel::from(combine_sentinels(inner.as_str(), outer.as_str())))
    }

    async fn release_sentinel(&self, keys: &[Key], sentinel: &Sentinel) {
        let (inner, outer) = split_sentinel(sentinel);
        self.outer.release_sentinel(keys, &outer).await;
        self.inner.release_sentinel(keys, &inner).await;
    }

    async fn add_dependency(&self, keys: &[Key], values: &[Key], ttl: Duration) -> Result<()> {
        self.outer.add_dependency(keys, values, ttl).await?;
        self.inner.add_dependency(keys, values, ttl).await
    }

    async fn clear_dependencies(&self, key: &Key, set_tombstone: bool) -> Result<()> {
        self.outer.clear_dependencies(key, set_tombstone).await?;
        self.inner.clear_dependencies(key, set_tombstone).await
    }

    async fn flush(&self, prefix: &str, flush_tombstones: bool) -> Result<()> {
        self.outer.flush(prefix, flush_tombstones).await?;
        self.inner.flush(prefix, flush_tombstones).await
    }

    fn cache_name(&self) -> &str {
        &self.name
    }

    async fn register_invalidation_handler(
        &self,
        handler: InvalidationHandler,
        key: Key,
    ) -> Result<()> {
        // The outer tier is already consistent once the inner one hears about a change.
        self.inner.register_invalidation_handler(handler, key).await
    }

    async fn log_key_values(&self, prefix: &str) -> Result<()> {
        self.outer.log_key_values(prefix).await?;
        self.inner.log_key_values(prefix).await
    }

    fn layered(&self) -> bool {
        true
    }

    fn supports_rate_limits(&self) -> bool {
        self.inner.supports_rate_limits() || self.outer.supports_rate_limits()
    }

    async fn reserve_rate_limit_slot(
        &self,
        keys: &[RateLimitKey],
        limit: i64,
        ttl: Duration,
        take_slot: bool,
    ) -> Result<RateLimitReservation> {
        self.rate_limit_layer()
            .reserve_rate_limit_slot(keys, limit, ttl, take_slot)
            .await
    }

    async fn release_rate_limit_slot(&self, keys: &[RateLimitKey]) -> Result<i64> {
        self.rate_limit_layer().release_rate_limit_slot(keys).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
        self.outer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{InMemoryOptions, InMemoryProvider};
    use crate::sentinel::WriteThroughSentinelManager;

    fn memory(name: &str) -> Arc<InMemoryProvider> {
        Arc::new(InMemoryProvider::new(
            name,
            Arc::new(WriteThroughSentinelManager::new()),
            InMemoryOptions::default(),
        ))
    }

    fn layered() -> (Arc<InMemoryProvider>, Arc<InMemoryProvider>, LayeringWrapper) {
        let inner = memory("inner");
        let outer = memory("outer");
        let wrapper = LayeringWrapper::new(inner.clone(), outer.clone());
        (inner, outer, wrapper)
    }

    #[test]
    fn test_sentinel_split() {
        let (inner, outer) = split_sentinel(&Sentinel::from("a#b"));
        assert_eq!(inner.as_str(), "a");
        assert_eq!(outer.as_str(), "b");

        let (inner, outer) = split_sentinel(&Sentinel::NO_LOCK);
        assert!(inner.is_no_lock() && outer.is_no_lock());

        assert_eq!(combine_sentinels("", ""), "");
        assert_eq!(combine_sentinels("a", ""), "a#");
    }

    #[test]
    fn test_tombstone_conflicts_collapse() {
        let inner = Sentinel::tombstone();
        let outer = Sentinel::tombstone();
        assert_eq!(
            combine_conflicts(Some(inner.as_str()), Some(outer.as_str())).as_deref(),
            Some(outer.as_str())
        );
        assert_eq!(combine_conflicts(None, Some("x")).as_deref(), Some("#x"));
        assert_eq!(combine_conflicts(None, None), None);
    }

    #[tokio::test]
    async fn test_name_and_capabilities() {
        let (_, _, wrapper) = layered();
        assert_eq!(wrapper.cache_name(), "Layered[inner,outer]");
        assert!(wrapper.layered());
        assert!(!wrapper.supports_rate_limits());
    }

    #[tokio::test]
    async fn test_write_then_read_through_both_tiers() {
        let (inner, outer, wrapper) = layered();
        let key = Key::from("item_1");

        let s = wrapper
            .write_sentinel(SentinelType::Create, &[key.clone()])
            .await
            .unwrap();
        assert!(s.as_str().contains(SENTINEL_SEPARATOR));

        let outcome = wrapper
            .set_value(&key, &[key.clone()], "v", &s, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, SetOutcome::SET);
        assert_eq!(inner.get_value(&key, false).await.unwrap().value.as_deref(), Some("v"));
        assert_eq!(outer.get_value(&key, false).await.unwrap().value.as_deref(), Some("v"));

        let lookup = wrapper.get_value(&key, true).await.unwrap();
        assert_eq!(lookup.value.as_deref(), Some("v"));
        assert!(!lookup.partial_hit);
    }

    #[tokio::test]
    async fn test_outer_hit_backfills_inner() {
        let (inner, outer, wrapper) = layered();
        let key = Key::from("item_2");
        let s = outer.write_sentinel(SentinelType::Create, &[key.clone()]).await.unwrap();
        outer
            .set_value(&key, &[key.clone()], "shared", &s, Duration::from_secs(60))
            .await
            .unwrap();

        let lookup = wrapper.get_value(&key, true).await.unwrap();
        assert_eq!(lookup.value.as_deref(), Some("shared"));
        assert!(lookup.partial_hit);
        assert_eq!(
            inner.get_value(&key, false).await.unwrap().value.as_deref(),
            Some("shared")
        );

        let again = wrapper.get_values(&[key.clone()], &[true]).await.unwrap();
        assert_eq!(again[0].value.as_deref(), Some("shared"));
        assert!(!again[0].partial_hit);
    }

    #[tokio::test]
    async fn test_miss_locks_both_tiers() {
        let (inner, outer, wrapper) = layered();
        let key = Key::from("item_3");

        let lookup = wrapper.get_value(&key, true).await.unwrap();
        assert!(lookup.value.is_none());
        let (inner_s, outer_s) = split_sentinel(&lookup.sentinel);
        assert!(!inner_s.is_no_lock());
        assert!(!outer_s.is_no_lock());

        let outcome = wrapper
            .set_value(&key, &[key.clone()], "v", &lookup.sentinel, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.set);
        assert!(inner.get_value(&key, false).await.unwrap().is_hit());
        assert!(outer.get_value(&key, false).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_outer_lock_failure_releases_inner() {
        let (inner, outer, wrapper) = layered();
        let key = Key::from("item_4");
        let held = outer.get_value(&key, true).await.unwrap().sentinel;
        assert!(!held.is_no_lock());

        let lookup = wrapper.get_value(&key, true).await.unwrap();
        assert!(lookup.sentinel.is_no_lock());
        assert_eq!(lookup.conflict.as_deref(), Some(format!("#{held}").as_str()));

        // The inner slot is free again.
        assert_eq!(inner.get_value(&key, false).await.unwrap(), CacheLookup::default());

        let s = wrapper
            .write_sentinel(SentinelType::Read, &[key.clone()])
            .await
            .unwrap();
        assert!(s.is_no_lock());
        assert_eq!(inner.get_value(&key, false).await.unwrap(), CacheLookup::default());
    }

    #[tokio::test]
    async fn test_set_value_requires_both_halves() {
        let (_, _, wrapper) = layered();
        let key = Key::from("item_5");
        let outcome = wrapper
            .set_value(&key, &[key.clone()], "v", &Sentinel::from("only_inner"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(outcome, SetOutcome::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_reaches_both_tiers() {
        let (inner, outer, wrapper) = layered();
        let key = Key::from("item_6");
        let s = wrapper
            .write_sentinel(SentinelType::Create, &[key.clone()])
            .await
            .unwrap();
        wrapper
            .set_value(&key, &[key.clone()], "v", &s, Duration::from_secs(60))
            .await
            .unwrap();

        wrapper.delete_value(&[key.clone()], true, true).await.unwrap();
        for tier in [&inner, &outer] {
            let lookup = tier.get_value(&key, false).await.unwrap();
            assert!(is_tombstone(lookup.conflict.as_deref().unwrap()));
        }
        let lookup = wrapper.get_value(&key, true).await.unwrap();
        assert!(is_tombstone(lookup.conflict.as_deref().unwrap()));
        assert!(lookup.sentinel.is_no_lock());
    }
}
