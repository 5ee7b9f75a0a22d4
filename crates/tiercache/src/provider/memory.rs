//! In-process provider.
//!
//! A single mutex guards a map of TTL'd entries. Nothing awaits while the
//! lock is held, so every operation is one short critical section and the
//! algorithms match the Redis provider without the round trips.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{
    CacheLookup, InvalidationHandler, Provider, SetOutcome, check_add_dependency_args,
    check_get_values_args,
};
use crate::config::ProviderSettings;
use crate::error::{CacheError, Result};
use crate::key::{Key, Sentinel, SentinelType, is_tombstone};
use crate::sentinel::{SentinelManager, SetDecision};

/// Tuning values for [`InMemoryProvider`].
#[derive(Debug, Clone)]
pub struct InMemoryOptions {
    /// Lifetime of lock sentinels.
    pub sentinel_ttl: Duration,
    /// Lifetime of tombstones. Zero disables tombstoning.
    pub tombstone_ttl: Duration,
    /// TTL applied when a caller passes a zero TTL.
    pub default_ttl: Duration,
}

impl Default for InMemoryOptions {
    fn default() -> Self {
        Self {
            sentinel_ttl: Duration::from_secs(70),
            tombstone_ttl: Duration::from_secs(10),
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&ProviderSettings> for InMemoryOptions {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            sentinel_ttl: settings.memory_sentinel_ttl(),
            tombstone_ttl: settings.tombstone_ttl(),
            default_ttl: settings.default_ttl(),
        }
    }
}

#[derive(Clone, Debug)]
enum EntryValue {
    Str(String),
    Set(HashSet<String>),
}

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
struct CachedEntry {
    value: EntryValue,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn new(value: EntryValue, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    fn string(value: impl Into<String>, ttl: Duration) -> Self {
        Self::new(EntryValue::Str(value.into()), ttl)
    }

    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }

    fn refresh(&mut self, ttl: Duration) {
        self.cached_at = Instant::now();
        self.ttl = ttl;
    }

    fn as_str(&self) -> Option<&str> {
        match &self.value {
            EntryValue::Str(s) => Some(s),
            EntryValue::Set(_) => None,
        }
    }
}

type Entries = HashMap<String, CachedEntry>;

/// Returns the live entry for `key`, dropping it first if it expired.
fn live<'a>(entries: &'a mut Entries, key: &str) -> Option<&'a mut CachedEntry> {
    if entries.get(key).is_some_and(CachedEntry::is_expired) {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn string_value(entries: &mut Entries, key: &str) -> Option<String> {
    live(entries, key).and_then(|e| e.as_str().map(str::to_string))
}

/// In-process cache provider.
pub struct InMemoryProvider {
    name: String,
    sm: Arc<dyn SentinelManager>,
    options: InMemoryOptions,
    entries: Mutex<Entries>,
}

impl InMemoryProvider {
    pub fn new(
        name: impl Into<String>,
        sm: Arc<dyn SentinelManager>,
        options: InMemoryOptions,
    ) -> Self {
        Self {
            name: name.into(),
            sm,
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Removes every expired entry.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }

    /// Number of entries, expired ones included until they are purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns a task purging expired entries every `interval`.
    ///
    /// The task stops once the provider is dropped.
    pub fn start_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let provider: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                let purged = provider.purge_expired();
                if purged > 0 {
                    debug!(cache = %provider.name, purged, "purged expired entries");
                }
            }
        })
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.options.default_ttl
        } else {
            ttl
        }
    }

    fn tombstones_enabled(&self) -> bool {
        !self.options.tombstone_ttl.is_zero()
    }

    fn sentinel_ttl_for(&self, sentinel: &Sentinel) -> Duration {
        if is_tombstone(sentinel.as_str()) {
            self.options.tombstone_ttl
        } else {
            self.options.sentinel_ttl
        }
    }

    fn lookup_locked(
        &self,
        entries: &mut Entries,
        key: &Key,
        lock_on_miss: bool,
        read_sentinel: &mut Option<Sentinel>,
    ) -> CacheLookup {
        match live(entries, key.as_str()) {
            Some(entry) => match entry.as_str() {
                Some(v) if self.sm.is_sentinel_value(v) => CacheLookup {
                    conflict: Some(v.to_string()),
                    ..CacheLookup::default()
                },
                Some(v) => CacheLookup::hit(v.to_string()),
                None => CacheLookup::default(),
            },
            None if lock_on_miss => {
                let sentinel = read_sentinel
                    .get_or_insert_with(|| self.sm.generate_sentinel(SentinelType::Read))
                    .clone();
                entries.insert(
                    key.to_string(),
                    CachedEntry::string(sentinel.as_str(), self.options.sentinel_ttl),
                );
                CacheLookup {
                    sentinel,
                    ..CacheLookup::default()
                }
            }
            None => CacheLookup::default(),
        }
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn get_value(&self, key: &Key, lock_on_miss: bool) -> Result<CacheLookup> {
        if key.is_empty() {
            return Err(CacheError::invalid_argument("GetValue called with a blank key"));
        }
        let mut entries = self.entries.lock();
        let mut read_sentinel = None;
        Ok(self.lookup_locked(&mut entries, key, lock_on_miss, &mut read_sentinel))
    }

    async fn get_values(&self, keys: &[Key], lock_on_miss: &[bool]) -> Result<Vec<CacheLookup>> {
        if keys.is_empty() && lock_on_miss.is_empty() {
            error!(cache = %self.name, "GetValues called with no keys");
            return Ok(Vec::new());
        }
        check_get_values_args(keys, lock_on_miss)?;

        let mut entries = self.entries.lock();
        let mut read_sentinel = None;
        let mut first_seen: HashMap<&Key, usize> = HashMap::new();
        let mut results: Vec<CacheLookup> = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            if let Some(&first) = first_seen.get(key) {
                let copy = results[first].clone();
                results.push(copy);
                continue;
            }
            first_seen.insert(key, i);
            results.push(self.lookup_locked(&mut entries, key, lock_on_miss[i], &mut read_sentinel));
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
        if keys.is_empty() || lock_key.is_empty() {
            return Err(CacheError::invalid_argument(
                "SetValue called with no keys or a blank lock key",
            ));
        }

        let ttl = self.effective_ttl(ttl);
        let mut entries = self.entries.lock();
        let Some(curr) = string_value(&mut entries, lock_key.as_str()) else {
            debug!(cache = %self.name, key = %lock_key, "SetValue lock key missing");
            return Ok(SetOutcome::NOT_SET);
        };

        match self.sm.can_set_value(&curr, value, sentinel) {
            SetDecision::Set => {
                for key in keys {
                    entries.insert(key.to_string(), CachedEntry::string(value, ttl));
                }
                debug!(cache = %self.name, keys = ?keys, "set value");
                Ok(SetOutcome::SET)
            }
            SetDecision::Clear => {
                for key in keys {
                    entries.remove(key.as_str());
                }
                debug!(cache = %self.name, keys = ?keys, "cleared keys on mismatched sentinel");
                Ok(SetOutcome::NOT_SET)
            }
            SetDecision::Conflict => {
                let marker = format!("{curr}{sentinel}");
                for key in keys {
                    entries.insert(
                        key.to_string(),
                        CachedEntry::string(marker.as_str(), self.options.sentinel_ttl),
                    );
                }
                debug!(cache = %self.name, keys = ?keys, "recorded write conflict");
                Ok(SetOutcome::CONFLICT)
            }
            SetDecision::Refresh => {
                for key in keys {
                    if let Some(entry) = live(&mut entries, key.as_str()) {
                        entry.refresh(self.options.tombstone_ttl);
                    }
                }
                Ok(SetOutcome::NOT_SET)
            }
            SetDecision::Skip => Ok(SetOutcome::CONFLICT),
        }
    }

    async fn delete_value(&self, keys: &[Key], set_tombstone: bool, force: bool) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let tombstone = (set_tombstone && self.tombstones_enabled()).then(Sentinel::tombstone);

        let mut entries = self.entries.lock();
        for key in keys {
            if !force {
                let held = string_value(&mut entries, key.as_str());
                if held.is_some_and(|v| self.sm.is_sentinel_value(&v)) {
                    continue;
                }
            }
            match &tombstone {
                Some(t) => {
                    entries.insert(
                        key.to_string(),
                        CachedEntry::string(t.as_str(), self.options.tombstone_ttl),
                    );
                }
                None => {
                    entries.remove(key.as_str());
                }
            }
        }
        debug!(cache = %self.name, keys = ?keys, set_tombstone, force, "deleted keys");
        Ok(())
    }

    async fn write_sentinel(&self, stype: SentinelType, keys: &[Key]) -> Result<Sentinel> {
        if keys.is_empty() {
            return Err(CacheError::invalid_argument("WriteSentinel called with no keys"));
        }

        let sentinel = self.sm.generate_sentinel(stype);
        let ttl = self.sentinel_ttl_for(&sentinel);
        let mut entries = self.entries.lock();

        if let Some(curr) = string_value(&mut entries, keys[0].as_str()) {
            let blocked = if self.sm.is_sentinel_value(&curr) {
                !self.sm.can_always_set_sentinel(&sentinel)
                    && !self.sm.can_set_sentinel_given_curr_val(&curr, &sentinel)
            } else {
                stype == SentinelType::Read
            };
            if blocked {
                debug!(cache = %self.name, key = %keys[0], %stype, "sentinel not granted");
                return Ok(Sentinel::NO_LOCK);
            }
        }

        // A sentinel that always wins overwrites tombstoned secondary keys too.
        let keep_tombstones = !self.sm.can_always_set_sentinel(&sentinel);
        for (i, key) in keys.iter().enumerate() {
            if i > 0 && keep_tombstones {
                if let Some(entry) = live(&mut entries, key.as_str()) {
                    if entry.as_str().is_some_and(is_tombstone) {
                        if stype != SentinelType::Read {
                            entry.refresh(self.options.tombstone_ttl);
                        }
                        continue;
                    }
                }
            }
            entries.insert(key.to_string(), CachedEntry::string(sentinel.as_str(), ttl));
        }
        debug!(cache = %self.name, keys = ?keys, %stype, "sentinel written");
        Ok(sentinel)
    }

    async fn release_sentinel(&self, keys: &[Key], sentinel: &Sentinel) {
        if sentinel.is_no_lock() {
            return;
        }
        let mut entries = self.entries.lock();
        for key in keys {
            if string_value(&mut entries, key.as_str()).as_deref() == Some(sentinel.as_str()) {
                entries.remove(key.as_str());
            }
        }
    }

    async fn add_dependency(&self, keys: &[Key], values: &[Key], ttl: Duration) -> Result<()> {
        let values = check_add_dependency_args(keys, values)?;
        let ttl = self.effective_ttl(ttl);

        let mut entries = self.entries.lock();
        for key in keys {
            let tombstoned = live(&mut entries, key.as_str())
                .and_then(|e| e.as_str())
                .is_some_and(is_tombstone);
            if tombstoned {
                debug!(cache = %self.name, key = %key, "dependency key is tombstoned");
                return Err(CacheError::TombstonedDependency);
            }
        }
        for key in keys {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| CachedEntry::new(EntryValue::Set(HashSet::new()), ttl));
            // Any other string value is replaced by the set.
            if let EntryValue::Str(_) = entry.value {
                entry.value = EntryValue::Set(HashSet::new());
            }
            if let EntryValue::Set(members) = &mut entry.value {
                members.extend(values.iter().map(|v| v.to_string()));
            }
            entry.refresh(ttl);
        }
        Ok(())
    }

    async fn clear_dependencies(&self, key: &Key, set_tombstone: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let members: Vec<String> = match live(&mut entries, key.as_str()) {
            Some(entry) => match &entry.value {
                EntryValue::Str(v) if is_tombstone(v) => return Ok(()),
                EntryValue::Str(_) => Vec::new(),
                EntryValue::Set(members) => members.iter().cloned().collect(),
            },
            None => Vec::new(),
        };

        for member in &members {
            entries.remove(member);
        }
        if set_tombstone && self.tombstones_enabled() {
            entries.insert(
                key.to_string(),
                CachedEntry::string(Sentinel::tombstone().into_string(), self.options.tombstone_ttl),
            );
        } else {
            entries.remove(key.as_str());
        }
        debug!(cache = %self.name, key = %key, members = members.len(), set_tombstone, "cleared dependencies");
        Ok(())
    }

    async fn flush(&self, prefix: &str, flush_tombstones: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.retain(|key, entry| {
            if entry.is_expired() {
                return false;
            }
            if !key.starts_with(prefix) {
                return true;
            }
            !flush_tombstones && entry.as_str().is_some_and(is_tombstone)
        });
        info!(cache = %self.name, prefix, flush_tombstones, "flushed cache");
        Ok(())
    }

    fn cache_name(&self) -> &str {
        &self.name
    }

    async fn register_invalidation_handler(
        &self,
        _handler: InvalidationHandler,
        _key: Key,
    ) -> Result<()> {
        Err(CacheError::unsupported("RegisterInvalidationHandler", &self.name))
    }

    async fn log_key_values(&self, prefix: &str) -> Result<()> {
        let entries = self.entries.lock();
        let mut keys: Vec<&String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        info!(cache = %self.name, prefix, count = keys.len(), "logging cache contents");
        for key in keys {
            match &entries[key].value {
                EntryValue::Str(v) => info!(cache = %self.name, key = %key, value = %v, "cache entry"),
                EntryValue::Set(m) => info!(cache = %self.name, key = %key, members = ?m, "cache set entry"),
            }
        }
        Ok(())
    }
}
