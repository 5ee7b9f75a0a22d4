//! Generic item API.
//!
//! [`Manager`] bundles a [`Provider`] with the key-name and TTL lookups and
//! implements the locking protocol every caller follows:
//!
//! 1. take a lock on the item (or collection) before touching the database
//! 2. read or write the database
//! 3. save the result under the lock, or delete the item from the cache
//! 4. release the lock if nothing consumed it
//!
//! Items are stored under their primary key and mirrored under their
//! secondary keys. Derived data (collections, secondary lookups) registers
//! itself in dependency sets so a change to the item tears it down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::error::{CacheError, Result};
use crate::item::{CacheableItem, KeyNameProvider, SKIP_CACHE_TTL, TtlProvider, Validateable};
use crate::key::{Key, Sentinel, SentinelType, is_tombstone};
use crate::metrics;
use crate::provider::{CacheLookup, Provider};

/// Collections depending on more items than this are not cached.
const MAX_COLLECTION_DEPENDENCIES: usize = 100;

/// Result of reading one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemLookup<T> {
    pub item: Option<T>,
    /// Sentinel or tombstone found in the slot (or in the is-modified slot).
    pub conflict: Option<String>,
    /// Read lock taken on a miss.
    pub sentinel: Sentinel,
    /// The item came from the outer layer of a layered cache.
    pub partial_hit: bool,
}

impl<T> Default for ItemLookup<T> {
    fn default() -> Self {
        Self {
            item: None,
            conflict: None,
            sentinel: Sentinel::NO_LOCK,
            partial_hit: false,
        }
    }
}

/// Result of reading several items.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemsLookup<T> {
    /// One entry per requested key.
    pub items: Vec<Option<T>>,
    pub sentinels: Vec<Sentinel>,
    /// Some missing item was modified recently, follower reads are unsafe.
    pub dirty: bool,
}

/// Provider plus the lookups needed to name and expire items.
#[derive(Clone)]
pub struct Manager {
    provider: Arc<dyn Provider>,
    names: Arc<dyn KeyNameProvider>,
    ttls: Arc<dyn TtlProvider>,
}

impl Manager {
    pub fn new(
        provider: Arc<dyn Provider>,
        names: Arc<dyn KeyNameProvider>,
        ttls: Arc<dyn TtlProvider>,
    ) -> Self {
        Self {
            provider,
            names,
            ttls,
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn names(&self) -> &dyn KeyNameProvider {
        self.names.as_ref()
    }

    pub fn ttls(&self) -> &dyn TtlProvider {
        self.ttls.as_ref()
    }

    fn ttl<T: CacheableItem>(&self) -> Duration {
        T::ttl(self.ttls.as_ref())
    }

    /// Flushes every key of this manager's namespace. Tombstones survive.
    pub async fn flush(&self, obj_type: &str) -> Result<()> {
        self.provider
            .flush(self.names.prefix(), false)
            .await
            .inspect_err(|e| {
                error!(cache = %self.provider.cache_name(), obj_type, error = %e, "error flushing cache");
            })
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Keys locked for `stype`, primary key first.
    pub fn item_lock_keys<T: CacheableItem>(&self, stype: SentinelType, item: &T) -> Vec<Key> {
        let names = self.names.as_ref();
        let mut keys = vec![item.primary_key(names)];
        if stype == SentinelType::Read {
            return keys;
        }
        keys.extend(item.global_collection_key(names));
        keys.extend(item.secondary_keys(names));
        if stype == SentinelType::Delete {
            keys.extend(item.per_item_collection_key(names));
        }
        keys
    }

    /// Locks an item ahead of a create, update, delete or read.
    ///
    /// A delete also tears down the item's dependencies so in-flight readers
    /// can't cache derived data computed before the delete.
    pub async fn take_item_lock<T: CacheableItem>(
        &self,
        stype: SentinelType,
        item: &T,
    ) -> Result<Sentinel> {
        let keys = self.item_lock_keys(stype, item);
        self.take_lock(stype, item, keys).await
    }

    /// Locks the collection owned by `item` and any `additional` sub-collections.
    pub async fn take_per_item_collection_lock<T: CacheableItem>(
        &self,
        stype: SentinelType,
        additional: &[Key],
        item: &T,
    ) -> Result<Sentinel> {
        check_collection_lock_type(stype)?;
        let mut keys = vec![self.per_item_collection_key(item)?];
        keys.extend_from_slice(additional);
        self.take_lock(stype, item, keys).await
    }

    /// Locks the collection of every item of `T`.
    pub async fn take_global_collection_lock<T: CacheableItem>(
        &self,
        stype: SentinelType,
        item: &T,
    ) -> Result<Sentinel> {
        check_collection_lock_type(stype)?;
        let key = item
            .global_collection_key(self.names.as_ref())
            .ok_or_else(|| CacheError::invalid_argument("item type has no global collection"))?;
        self.take_lock(stype, item, vec![key]).await
    }

    fn per_item_collection_key<T: CacheableItem>(&self, item: &T) -> Result<Key> {
        item.per_item_collection_key(self.names.as_ref())
            .ok_or_else(|| CacheError::invalid_argument("item has no per-item collection"))
    }

    async fn take_lock<T: CacheableItem>(
        &self,
        stype: SentinelType,
        item: &T,
        keys: Vec<Key>,
    ) -> Result<Sentinel> {
        let result = self.take_lock_inner(stype, item, &keys).await;
        result.map_err(|e| {
            warn!(cache = %self.provider.cache_name(), keys = ?keys, %stype, error = %e, "failed to get a lock");
            CacheError::LockContention
        })
    }

    async fn take_lock_inner<T: CacheableItem>(
        &self,
        stype: SentinelType,
        item: &T,
        keys: &[Key],
    ) -> Result<Sentinel> {
        let sentinel = self.provider.write_sentinel(stype, keys).await?;

        if stype == SentinelType::Delete {
            let names = self.names.as_ref();
            // Follower reads are tracked through the is-modified key, no tombstone needed.
            if let Some(pages) = item.global_collection_pages_key(names)
                && let Err(e) = self.provider.clear_dependencies(&pages, false).await
            {
                warn!(key = %pages, error = %e, "failed to clear global collection pages");
            }
            if let Some(deps) = item.dependencies_key(names) {
                self.provider.clear_dependencies(&deps, true).await?;
            }
        }
        Ok(sentinel)
    }

    /// Releases a lock taken by [`take_item_lock`](Self::take_item_lock).
    pub async fn release_item_lock<T: CacheableItem>(
        &self,
        stype: SentinelType,
        item: &T,
        sentinel: &Sentinel,
    ) {
        if sentinel.is_no_lock() {
            return;
        }
        let keys = self.item_lock_keys(stype, item);
        self.provider.release_sentinel(&keys, sentinel).await;
    }

    pub async fn release_per_item_collection_lock<T: CacheableItem>(
        &self,
        additional: &[Key],
        item: &T,
        sentinel: &Sentinel,
    ) {
        if sentinel.is_no_lock() {
            return;
        }
        let Some(key) = item.per_item_collection_key(self.names.as_ref()) else {
            return;
        };
        let mut keys = vec![key];
        keys.extend_from_slice(additional);
        self.provider.release_sentinel(&keys, sentinel).await;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads an array of items stored under `key`.
    pub async fn get_items_array_from_cache<T: CacheableItem>(
        &self,
        key: &Key,
        lock_on_miss: bool,
    ) -> Result<ItemLookup<Vec<T>>> {
        let lookup = self
            .get_worker::<Vec<T>>(key, None, lock_on_miss, self.ttl::<T>())
            .await?;
        if let Some(items) = &lookup.item {
            for item in items {
                if !self.validate_item("get_items_array_from_cache", item, key).await {
                    return Ok(ItemLookup::default());
                }
            }
        }
        Ok(lookup)
    }

    pub async fn get_item_from_cache<T: CacheableItem>(
        &self,
        key: &Key,
        lock_on_miss: bool,
    ) -> Result<ItemLookup<T>> {
        let lookup = self
            .get_worker::<T>(key, None, lock_on_miss, self.ttl::<T>())
            .await?;
        self.validated("get_item_from_cache", key, lookup).await
    }

    /// Like [`get_item_from_cache`](Self::get_item_from_cache), but reports
    /// the is-modified slot's content as the conflict.
    pub async fn get_item_from_cache_with_modified_key<T: CacheableItem>(
        &self,
        key: &Key,
        is_modified_key: &Key,
        lock_on_miss: bool,
    ) -> Result<ItemLookup<T>> {
        let lookup = self
            .get_worker::<T>(key, Some(is_modified_key), lock_on_miss, self.ttl::<T>())
            .await?;
        self.validated("get_item_from_cache_with_modified_key", key, lookup)
            .await
    }

    async fn validated<T: CacheableItem>(
        &self,
        api: &str,
        key: &Key,
        lookup: ItemLookup<T>,
    ) -> Result<ItemLookup<T>> {
        if let Some(item) = &lookup.item
            && !self.validate_item(api, item, key).await
        {
            return Ok(ItemLookup::default());
        }
        Ok(lookup)
    }

    /// Evicts `key` when the cached item fails validation.
    async fn validate_item<V: Validateable>(&self, api: &str, item: &V, key: &Key) -> bool {
        let Err(reason) = item.validate() else {
            return true;
        };
        error!(api, key = %key, type_name = std::any::type_name::<V>(), reason = %reason, "cached item failed validation");
        if let Err(e) = self
            .provider
            .delete_value(std::slice::from_ref(key), false, true)
            .await
        {
            warn!(api, key = %key, error = %e, "failed to evict invalid item");
        }
        false
    }

    async fn get_worker<V: DeserializeOwned>(
        &self,
        key: &Key,
        is_modified_key: Option<&Key>,
        mut lock_on_miss: bool,
        ttl: Duration,
    ) -> Result<ItemLookup<V>> {
        if ttl == SKIP_CACHE_TTL {
            return Ok(ItemLookup::default());
        }

        let start = Instant::now();
        let lookup = match is_modified_key {
            None => self.provider.get_value(key, lock_on_miss).await?,
            Some(mkey) => {
                let layered = self.provider.layered();
                let mut lookup = CacheLookup::default();
                // A layered cache serves the value from the inner tier without
                // a round trip to the is-modified key.
                if layered {
                    lookup = self.provider.get_value(key, lock_on_miss).await?;
                    lock_on_miss = false;
                }
                if !lookup.is_hit() {
                    let mut both = self
                        .provider
                        .get_values(&[key.clone(), mkey.clone()], &[lock_on_miss, false])
                        .await?;
                    if both.len() == 2 {
                        let modified = both.pop().unwrap_or_default();
                        let value = both.pop().unwrap_or_default();
                        lookup.value = value.value;
                        lookup.conflict = modified.conflict;
                        if !layered {
                            lookup.sentinel = value.sentinel;
                        }
                    }
                }
                lookup
            }
        };
        let took = start.elapsed();
        let cache = self.provider.cache_name();

        let Some(raw) = lookup.value else {
            metrics::record_cache_miss(cache);
            debug!(cache = %cache, key = %key, took_us = took.as_micros() as u64, "cache miss");
            return Ok(ItemLookup {
                item: None,
                conflict: lookup.conflict,
                sentinel: lookup.sentinel,
                partial_hit: false,
            });
        };

        match serde_json::from_str::<V>(&raw) {
            Ok(item) => {
                metrics::record_cache_hit(cache);
                Ok(ItemLookup {
                    item: Some(item),
                    conflict: lookup.conflict,
                    sentinel: Sentinel::NO_LOCK,
                    partial_hit: lookup.partial_hit,
                })
            }
            Err(e) => {
                error!(cache = %cache, key = %key, type_name = std::any::type_name::<V>(), error = %e, "failed to unmarshal cached item");
                Ok(ItemLookup {
                    item: None,
                    conflict: lookup.conflict,
                    sentinel: Sentinel::NO_LOCK,
                    partial_hit: lookup.partial_hit,
                })
            }
        }
    }

    /// Reads several items at once.
    ///
    /// On any miss the `mkeys` are checked too, so the caller knows whether
    /// the database read can go to a follower.
    pub async fn get_items_from_cache<T: CacheableItem>(
        &self,
        keys: &[Key],
        mkeys: &[Key],
        locks_on_miss: &[bool],
    ) -> Result<ItemsLookup<T>> {
        if self.ttl::<T>() == SKIP_CACHE_TTL {
            return Ok(ItemsLookup {
                items: keys.iter().map(|_| None).collect(),
                sentinels: vec![Sentinel::NO_LOCK; keys.len()],
                dirty: true,
            });
        }

        let cache = self.provider.cache_name();
        let lookups = self.provider.get_values(keys, locks_on_miss).await?;
        let mut items = Vec::with_capacity(keys.len());
        let mut sentinels = Vec::with_capacity(keys.len());
        let (mut hits, mut misses) = (0, 0);

        for (key, lookup) in keys.iter().zip(lookups) {
            sentinels.push(lookup.sentinel);
            let item = match lookup.value.as_deref().map(serde_json::from_str::<T>) {
                None => None,
                Some(Ok(item)) => Some(item),
                Some(Err(e)) => {
                    error!(cache = %cache, key = %key, error = %e, "failed to unmarshal cached item");
                    None
                }
            };
            let valid = match &item {
                Some(item) => self.validate_item("get_items_from_cache", item, key).await,
                None => false,
            };
            if valid {
                hits += 1;
                items.push(item);
            } else {
                misses += 1;
                items.push(None);
            }
        }
        metrics::record_multiget(cache, hits, misses);

        let mut dirty = false;
        if misses > 0 && !mkeys.is_empty() {
            let modified = self
                .provider
                .get_values(mkeys, &vec![false; mkeys.len()])
                .await?;
            dirty = modified
                .iter()
                .any(|m| m.conflict.as_deref().is_some_and(is_tombstone));
        }

        Ok(ItemsLookup {
            items,
            sentinels,
            dirty,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Tombstones every key of a deleted item.
    pub async fn delete_item_from_cache<T: CacheableItem>(&self, item: &T, sentinel: &Sentinel) {
        if sentinel.is_no_lock() {
            return;
        }
        let names = self.names.as_ref();
        let mut keys = self.item_lock_keys(SentinelType::Delete, item);
        keys.extend(item.is_modified_key(names));
        keys.extend(item.is_modified_collection_key(names));

        if let Err(e) = self.provider.delete_value(&keys, true, true).await {
            warn!(cache = %self.provider.cache_name(), keys = ?keys, error = %e, "failed to delete item keys");
        }
    }

    /// Stores `item` under its primary and secondary keys.
    ///
    /// With `clear_collection` every collection the item may appear in is
    /// invalidated too.
    pub async fn save_item_to_cache<T: CacheableItem>(
        &self,
        item: &T,
        sentinel: &Sentinel,
        clear_collection: bool,
        additional_col_keys: &[Key],
    ) {
        let lock_key = item.primary_key(self.names.as_ref());
        self.save_worker(item, &lock_key, sentinel, clear_collection, additional_col_keys)
            .await;
    }

    /// Stores items read as part of their global collection, locked by the
    /// global collection key.
    pub async fn save_items_from_collection_to_cache<T: CacheableItem>(
        &self,
        items: &[T],
        sentinel: &Sentinel,
    ) {
        for item in items {
            let Some(lock_key) = item.global_collection_key(self.names.as_ref()) else {
                continue;
            };
            self.save_worker(item, &lock_key, sentinel, false, &[]).await;
        }
    }

    async fn save_worker<T: CacheableItem>(
        &self,
        item: &T,
        lock_key: &Key,
        sentinel: &Sentinel,
        clear_collection: bool,
        additional_col_keys: &[Key],
    ) {
        let ttl = self.ttl::<T>();
        if ttl == SKIP_CACHE_TTL || sentinel.is_no_lock() {
            return;
        }
        let value = match serde_json::to_string(item) {
            Ok(value) => value,
            Err(e) => {
                error!(type_name = std::any::type_name::<T>(), error = %e, "failed to marshal item");
                return;
            }
        };

        let names = self.names.as_ref();
        let cache = self.provider.cache_name();
        let secondary = item.secondary_keys(names);
        let mut value_keys = secondary.clone();
        value_keys.push(item.primary_key(names));

        let mut key_set = match self
            .provider
            .set_value(lock_key, &value_keys, &value, sentinel, ttl)
            .await
        {
            Ok(outcome) => outcome.set,
            Err(e) => {
                error!(cache = %cache, keys = ?value_keys, error = %e, "error saving item to cache");
                false
            }
        };
        let mut clear_on_error = false;

        // Cleared even on conflict: on-machine caches still hold the old item.
        if clear_collection {
            let mut collection_keys = Vec::new();
            if item.is_modified_collection_key(names).is_none() {
                collection_keys.extend(item.global_collection_key(names));
            }
            // Tombstoned is-modified keys disable follower reads.
            collection_keys.extend(item.is_modified_key(names));
            collection_keys.extend(item.is_modified_collection_key(names));
            collection_keys.extend_from_slice(additional_col_keys);

            if let Err(e) = self.provider.delete_value(&collection_keys, true, true).await {
                error!(cache = %cache, keys = ?collection_keys, error = %e, "error clearing collection keys");
                clear_on_error = true;
                key_set = false;
            }
            if let Some(deps) = item.dependencies_key(names)
                && let Err(e) = self.provider.clear_dependencies(&deps, false).await
            {
                error!(cache = %cache, key = %deps, error = %e, "error clearing dependencies");
                clear_on_error = true;
                key_set = false;
            }
            if let Some(pages) = item.global_collection_pages_key(names)
                && let Err(e) = self.provider.clear_dependencies(&pages, false).await
            {
                error!(cache = %cache, key = %pages, error = %e, "error clearing global collection pages");
            }
            debug!(cache = %cache, keys = ?collection_keys, "cleared collection keys");
        }

        let dependency_keys = item.dependency_keys(names);
        if key_set
            && !dependency_keys.is_empty()
            && let Err(e) = self
                .provider
                .add_dependency(&dependency_keys, &value_keys, ttl)
                .await
        {
            warn!(cache = %cache, keys = ?dependency_keys, error = %e, "failed to add item to dependency lists");
            clear_on_error = true;
            key_set = false;
        }

        // A failure here usually means the item was deleted after it was stored.
        if key_set
            && !secondary.is_empty()
            && let Some(own) = item.dependencies_key(names)
            && let Err(e) = self
                .provider
                .add_dependency(std::slice::from_ref(&own), &secondary, ttl)
                .await
        {
            debug!(cache = %cache, key = %own, error = %e, "failed to register secondary keys");
            clear_on_error = true;
        }

        if clear_on_error
            && let Err(e) = self.provider.delete_value(&value_keys, true, true).await
        {
            warn!(cache = %cache, keys = ?value_keys, error = %e, "failed to delete keys after dependency failure");
        }
    }

    /// Stores `members` as a collection under `col_key`.
    ///
    /// For a per-item collection `owner` is the item owning it. The
    /// collection is only stored once `col_key` is registered in the
    /// dependency set of everything it was built from, so any later change
    /// to a member reaches it.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_items_to_collection<T: CacheableItem, C: CacheableItem>(
        &self,
        owner: &T,
        members: &[C],
        lock_key: &Key,
        col_key: &Key,
        sentinel: &Sentinel,
        is_global: bool,
    ) {
        let ttl = self.ttl::<T>();
        if ttl == SKIP_CACHE_TTL || col_key.is_empty() || lock_key.is_empty() || sentinel.is_no_lock() {
            return;
        }
        let value = match serde_json::to_string(members) {
            Ok(value) => value,
            Err(e) => {
                error!(key = %col_key, error = %e, "failed to marshal collection");
                return;
            }
        };

        let names = self.names.as_ref();
        let cache = self.provider.cache_name();
        let col_keys = std::slice::from_ref(col_key);

        if !is_global {
            let mut seen = HashSet::new();
            let mut dependents = Vec::new();
            for member in members {
                for key in member
                    .dependency_keys(names)
                    .into_iter()
                    .chain(member.dependencies_key(names))
                {
                    if !key.is_empty() && seen.insert(key.clone()) {
                        dependents.push(key);
                    }
                }
            }
            if dependents.len() > MAX_COLLECTION_DEPENDENCIES {
                debug!(cache = %cache, key = %col_key, dependencies = dependents.len(), "collection has too many dependencies, not caching");
                return;
            }
            if let Some(own) = owner.dependencies_key(names)
                && seen.insert(own.clone())
            {
                dependents.push(own);
            }

            if !dependents.is_empty()
                && let Err(e) = self.provider.add_dependency(&dependents, col_keys, ttl).await
            {
                warn!(cache = %cache, key = %col_key, error = %e, "didn't cache collection, failed to add dependency");
                return;
            }
        } else if let Some(pages) = owner.global_collection_pages_key(names)
            && owner.global_collection_key(names).as_ref() != Some(col_key)
            && let Err(e) = self
                .provider
                .add_dependency(std::slice::from_ref(&pages), col_keys, ttl)
                .await
        {
            warn!(cache = %cache, key = %col_key, error = %e, "didn't cache global collection page, failed to add dependency");
            return;
        }

        match self
            .provider
            .set_value(lock_key, col_keys, &value, sentinel, ttl)
            .await
        {
            Ok(outcome) if outcome.set => debug!(cache = %cache, key = %col_key, "saved collection"),
            Ok(_) => {}
            Err(e) => warn!(cache = %cache, key = %col_key, error = %e, "failed to save collection"),
        }
    }
}

fn check_collection_lock_type(stype: SentinelType) -> Result<()> {
    match stype {
        SentinelType::Delete | SentinelType::Read => Ok(()),
        other => Err(CacheError::InvalidLockType {
            lock_type: other.to_string(),
        }),
    }
}
