//! Redis-backed provider.
//!
//! Conditional writes use optimistic transactions: `WATCH` the slots, read
//! them, let the [`SentinelManager`] decide, then `MULTI`/`EXEC`. A nil
//! `EXEC` reply means another client touched a watched key and the whole
//! round is retried, up to `max_retries` times.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{
    Connection, Pool,
    redis::{self, AsyncCommands, Pipeline},
};
use tracing::{debug, error, info, warn};

use super::{
    CacheLookup, InvalidationHandler, Provider, RateLimitReservation, SetOutcome,
    check_add_dependency_args, check_get_values_args,
};
use crate::config::ProviderSettings;
use crate::error::{CacheError, Result};
use crate::key::{Key, RateLimitKey, Sentinel, SentinelType, is_tombstone};
use crate::sentinel::{SentinelManager, SetDecision};

const SCAN_COUNT: usize = 100;

/// Tuning values for [`RedisProvider`].
#[derive(Debug, Clone)]
pub struct RedisProviderOptions {
    /// Every key handed to the provider must start with this prefix.
    pub key_prefix: String,
    /// Serve reads only. Writes and locks become no-ops.
    pub read_only: bool,
    pub sentinel_ttl: Duration,
    /// Lifetime of tombstones. Zero disables tombstoning.
    pub tombstone_ttl: Duration,
    /// Attempts per optimistic transaction.
    pub max_retries: u32,
    /// TTL applied when a caller passes a zero TTL.
    pub default_ttl: Duration,
}

impl Default for RedisProviderOptions {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            read_only: false,
            sentinel_ttl: Duration::from_secs(60),
            tombstone_ttl: Duration::from_secs(10),
            max_retries: 15,
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&ProviderSettings> for RedisProviderOptions {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            sentinel_ttl: settings.sentinel_ttl(),
            tombstone_ttl: settings.tombstone_ttl(),
            max_retries: settings.max_retries,
            default_ttl: settings.default_ttl(),
            ..Self::default()
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn names(keys: &[Key]) -> Vec<&str> {
    keys.iter().map(Key::as_str).collect()
}

fn check_prefix<K: AsRef<str>>(prefix: &str, keys: impl IntoIterator<Item = K>) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    match keys.into_iter().find(|k| !k.as_ref().starts_with(prefix)) {
        Some(key) => Err(CacheError::key_prefix(key.as_ref(), prefix)),
        None => Ok(()),
    }
}

fn is_wrong_type(err: &redis::RedisError) -> bool {
    err.code() == Some("WRONGTYPE") || err.to_string().contains("WRONGTYPE")
}

async fn watch(conn: &mut Connection, keys: &[&str]) -> Result<()> {
    let _: () = redis::cmd("WATCH").arg(keys).query_async(conn).await?;
    Ok(())
}

async fn unwatch(conn: &mut Connection) {
    let reply: redis::RedisResult<()> = redis::cmd("UNWATCH").query_async(conn).await;
    if let Err(e) = reply {
        warn!(error = %e, "UNWATCH failed");
    }
}

/// Passes a read issued under `WATCH` through, unwatching when it failed.
///
/// The connection goes back to the pool afterwards and must not carry
/// watched keys to its next borrower.
async fn or_unwatch<T>(conn: &mut Connection, reply: redis::RedisResult<T>) -> Result<T> {
    match reply {
        Ok(value) => Ok(value),
        Err(e) => {
            unwatch(conn).await;
            Err(e.into())
        }
    }
}

/// Runs a `MULTI`/`EXEC` pipeline. Returns `false` when a watched key changed.
async fn exec(conn: &mut Connection, pipe: &Pipeline) -> Result<bool> {
    let reply: Option<()> = pipe.query_async(conn).await?;
    Ok(reply.is_some())
}

fn set_px(pipe: &mut Pipeline, key: &str, value: &str, ttl: Duration) {
    pipe.cmd("SET")
        .arg(key)
        .arg(value)
        .arg("PX")
        .arg(millis(ttl))
        .ignore();
}

fn pexpire(pipe: &mut Pipeline, key: &str, ttl: Duration) {
    pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
}

/// Redis cache provider.
pub struct RedisProvider {
    name: String,
    pool: Pool,
    sm: Arc<dyn SentinelManager>,
    options: RedisProviderOptions,
}

impl RedisProvider {
    pub fn new(
        name: impl Into<String>,
        pool: Pool,
        sm: Arc<dyn SentinelManager>,
        options: RedisProviderOptions,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            sm,
            options,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(CacheError::pool)
    }

    fn tombstones_enabled(&self) -> bool {
        !self.options.tombstone_ttl.is_zero()
    }

    fn effective_ttl(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.options.default_ttl
        } else {
            ttl
        }
    }

    fn sentinel_ttl_for(&self, sentinel: &Sentinel) -> Duration {
        if is_tombstone(sentinel.as_str()) {
            self.options.tombstone_ttl
        } else {
            self.options.sentinel_ttl
        }
    }

    fn to_lookup(&self, value: Option<String>) -> CacheLookup {
        match value {
            Some(v) if self.sm.is_sentinel_value(&v) => CacheLookup {
                conflict: Some(v),
                ..CacheLookup::default()
            },
            Some(v) => CacheLookup::hit(v),
            None => CacheLookup::default(),
        }
    }

    /// Takes a read lock on every missing key in one command.
    async fn lock_misses(&self, conn: &mut Connection, keys: &[&str]) -> Result<Sentinel> {
        let sentinel = self.sm.generate_sentinel(SentinelType::Read);
        let ttl = millis(self.options.sentinel_ttl);

        let granted = if let [key] = keys {
            let reply: Option<String> = redis::cmd("SET")
                .arg(*key)
                .arg(sentinel.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl)
                .query_async(conn)
                .await?;
            reply.is_some()
        } else {
            let mut args: Vec<&str> = Vec::with_capacity(keys.len() * 2);
            for key in keys {
                args.push(key);
                args.push(sentinel.as_str());
            }
            let set: i64 = redis::cmd("MSETNX").arg(&args).query_async(&mut *conn).await?;
            if set == 1 {
                let mut pipe = redis::pipe();
                for key in keys {
                    pipe.cmd("PEXPIRE").arg(*key).arg(ttl).ignore();
                }
                let _: () = pipe.query_async(conn).await?;
            }
            set == 1
        };

        Ok(if granted { sentinel } else { Sentinel::NO_LOCK })
    }

    async fn try_release(&self, keys: &[Key], sentinel: &Sentinel) -> Result<()> {
        let keys = names(keys);
        let mut conn = self.conn().await?;
        for _ in 0..self.options.max_retries {
            watch(&mut conn, &keys).await?;
            let reply: redis::RedisResult<Vec<Option<String>>> = conn.mget(&keys).await;
            let current = or_unwatch(&mut conn, reply).await?;
            let held: Vec<&str> = keys
                .iter()
                .zip(&current)
                .filter(|(_, v)| v.as_deref() == Some(sentinel.as_str()))
                .map(|(k, _)| *k)
                .collect();
            if held.is_empty() {
                unwatch(&mut conn).await;
                return Ok(());
            }
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("DEL").arg(&held).ignore();
            if exec(&mut conn, &pipe).await? {
                return Ok(());
            }
        }
        Err(CacheError::retries_exhausted("ReleaseSentinel"))
    }

    async fn scan(&self, conn: &mut Connection, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl Provider for RedisProvider {
    async fn get_value(&self, key: &Key, lock_on_miss: bool) -> Result<CacheLookup> {
        let mut results = self
            .get_values(std::slice::from_ref(key), &[lock_on_miss])
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    async fn get_values(&self, keys: &[Key], lock_on_miss: &[bool]) -> Result<Vec<CacheLookup>> {
        if keys.is_empty() && lock_on_miss.is_empty() {
            error!(cache = %self.name, "GetValues called with no keys");
            return Ok(Vec::new());
        }
        check_get_values_args(keys, lock_on_miss)?;
        check_prefix(&self.options.key_prefix, keys)?;

        let key_names = names(keys);
        let mut conn = self.conn().await?;
        let values: Vec<Option<String>> = conn.mget(&key_names).await?;

        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        let mut results: Vec<CacheLookup> = Vec::with_capacity(keys.len());
        let mut to_lock: Vec<usize> = Vec::new();
        for (i, value) in values.into_iter().enumerate() {
            if first_seen.contains_key(key_names[i]) {
                results.push(CacheLookup::default());
                continue;
            }
            first_seen.insert(key_names[i], i);
            let lookup = self.to_lookup(value);
            if lookup.value.is_none()
                && lookup.conflict.is_none()
                && lock_on_miss[i]
                && !self.options.read_only
            {
                to_lock.push(i);
            }
            results.push(lookup);
        }

        if !to_lock.is_empty() {
            let lock_names: Vec<&str> = to_lock.iter().map(|&i| key_names[i]).collect();
            let sentinel = self.lock_misses(&mut conn, &lock_names).await?;
            if sentinel.is_no_lock() {
                debug!(cache = %self.name, keys = ?lock_names, "read lock not granted");
            }
            for &i in &to_lock {
                results[i].sentinel = sentinel.clone();
            }
        }

        for (i, name) in key_names.iter().enumerate() {
            if let Some(&first) = first_seen.get(name) {
                if first != i {
                    results[i] = results[first].clone();
                }
            }
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
        check_prefix(&self.options.key_prefix, keys.iter().chain([lock_key]))?;
        if self.options.read_only {
            return Ok(SetOutcome::NOT_SET);
        }

        let ttl = self.effective_ttl(ttl);
        let key_names = names(keys);
        let mut conn = self.conn().await?;
        for attempt in 0..self.options.max_retries {
            watch(&mut conn, &[lock_key.as_str()]).await?;
            let reply: redis::RedisResult<Option<String>> = conn.get(lock_key.as_str()).await;
            let curr = or_unwatch(&mut conn, reply).await?;
            let Some(curr) = curr else {
                unwatch(&mut conn).await;
                debug!(cache = %self.name, key = %lock_key, "SetValue lock key missing");
                return Ok(SetOutcome::NOT_SET);
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            let outcome = match self.sm.can_set_value(&curr, value, sentinel) {
                SetDecision::Set => {
                    for key in &key_names {
                        set_px(&mut pipe, key, value, ttl);
                    }
                    SetOutcome::SET
                }
                SetDecision::Clear => {
                    pipe.cmd("DEL").arg(&key_names).ignore();
                    SetOutcome::NOT_SET
                }
                SetDecision::Conflict => {
                    let marker = format!("{curr}{sentinel}");
                    for key in &key_names {
                        set_px(&mut pipe, key, &marker, self.options.sentinel_ttl);
                    }
                    SetOutcome::CONFLICT
                }
                SetDecision::Refresh => {
                    for key in &key_names {
                        pexpire(&mut pipe, key, self.options.tombstone_ttl);
                    }
                    SetOutcome::NOT_SET
                }
                SetDecision::Skip => {
                    unwatch(&mut conn).await;
                    return Ok(SetOutcome::CONFLICT);
                }
            };

            if exec(&mut conn, &pipe).await? {
                debug!(cache = %self.name, keys = ?key_names, set = outcome.set, conflict = outcome.conflict, "SetValue");
                return Ok(outcome);
            }
            debug!(cache = %self.name, key = %lock_key, attempt, "SetValue transaction aborted, retrying");
        }
        Err(CacheError::retries_exhausted("SetValue"))
    }

    async fn delete_value(&self, keys: &[Key], set_tombstone: bool, force: bool) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        check_prefix(&self.options.key_prefix, keys)?;
        if self.options.read_only {
            return Ok(());
        }

        let tombstone = (set_tombstone && self.tombstones_enabled()).then(Sentinel::tombstone);
        let write = |pipe: &mut Pipeline, targets: &[&str]| match &tombstone {
            Some(t) => {
                for key in targets {
                    set_px(pipe, key, t.as_str(), self.options.tombstone_ttl);
                }
            }
            None => {
                pipe.cmd("DEL").arg(targets).ignore();
            }
        };

        let key_names = names(keys);
        let mut conn = self.conn().await?;
        if force {
            let mut pipe = redis::pipe();
            pipe.atomic();
            write(&mut pipe, key_names.as_slice());
            let _: () = pipe.query_async(&mut conn).await?;
            debug!(cache = %self.name, keys = ?key_names, set_tombstone, "force deleted keys");
            return Ok(());
        }

        for _ in 0..self.options.max_retries {
            watch(&mut conn, &key_names).await?;
            let reply: redis::RedisResult<Vec<Option<String>>> = conn.mget(&key_names).await;
            let current = or_unwatch(&mut conn, reply).await?;
            let targets: Vec<&str> = key_names
                .iter()
                .zip(&current)
                .filter(|(_, v)| !v.as_deref().is_some_and(|v| self.sm.is_sentinel_value(v)))
                .map(|(k, _)| *k)
                .collect();
            if targets.is_empty() {
                unwatch(&mut conn).await;
                return Ok(());
            }
            let mut pipe = redis::pipe();
            pipe.atomic();
            write(&mut pipe, targets.as_slice());
            if exec(&mut conn, &pipe).await? {
                debug!(cache = %self.name, keys = ?targets, set_tombstone, "deleted keys");
                return Ok(());
            }
        }
        Err(CacheError::retries_exhausted("DeleteValue"))
    }

    async fn write_sentinel(&self, stype: SentinelType, keys: &[Key]) -> Result<Sentinel> {
        if keys.is_empty() {
            return Err(CacheError::invalid_argument("WriteSentinel called with no keys"));
        }
        check_prefix(&self.options.key_prefix, keys)?;
        if self.options.read_only {
            return Ok(Sentinel::NO_LOCK);
        }

        let sentinel = self.sm.generate_sentinel(stype);
        let ttl = self.sentinel_ttl_for(&sentinel);
        let key_names = names(keys);
        let mut conn = self.conn().await?;

        for attempt in 0..self.options.max_retries {
            watch(&mut conn, &key_names).await?;
            let reply: redis::RedisResult<Vec<Option<String>>> = conn.mget(&key_names).await;
            let current = or_unwatch(&mut conn, reply).await?;

            if let Some(Some(curr)) = current.first() {
                let blocked = if self.sm.is_sentinel_value(curr) {
                    !self.sm.can_always_set_sentinel(&sentinel)
                        && !self.sm.can_set_sentinel_given_curr_val(curr, &sentinel)
                } else {
                    stype == SentinelType::Read
                };
                if blocked {
                    unwatch(&mut conn).await;
                    debug!(cache = %self.name, key = %keys[0], %stype, "sentinel not granted");
                    return Ok(Sentinel::NO_LOCK);
                }
            }

            // A sentinel that always wins overwrites tombstoned secondary keys too.
            let keep_tombstones = !self.sm.can_always_set_sentinel(&sentinel);
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (i, key) in key_names.iter().enumerate() {
                let tombstoned = current[i].as_deref().is_some_and(is_tombstone);
                if i > 0 && tombstoned && keep_tombstones {
                    if stype != SentinelType::Read {
                        pexpire(&mut pipe, key, self.options.tombstone_ttl);
                    }
                    continue;
                }
                set_px(&mut pipe, key, sentinel.as_str(), ttl);
            }

            if exec(&mut conn, &pipe).await? {
                debug!(cache = %self.name, keys = ?key_names, %stype, "sentinel written");
                return Ok(sentinel);
            }
            debug!(cache = %self.name, key = %keys[0], attempt, "WriteSentinel transaction aborted, retrying");
        }
        Err(CacheError::retries_exhausted("WriteSentinel"))
    }

    async fn release_sentinel(&self, keys: &[Key], sentinel: &Sentinel) {
        if sentinel.is_no_lock() || keys.is_empty() || self.options.read_only {
            return;
        }
        if let Err(e) = self.try_release(keys, sentinel).await {
            error!(cache = %self.name, keys = ?keys, error = %e, "failed to release sentinel");
        }
    }

    async fn add_dependency(&self, keys: &[Key], values: &[Key], ttl: Duration) -> Result<()> {
        let values = check_add_dependency_args(keys, values)?;
        check_prefix(&self.options.key_prefix, keys.iter().chain(values.iter().copied()))?;
        if self.options.read_only {
            return Ok(());
        }

        let ttl = self.effective_ttl(ttl);
        let key_names = names(keys);
        let members: Vec<&str> = values.iter().map(|v| v.as_str()).collect();
        let mut conn = self.conn().await?;
        for _ in 0..self.options.max_retries {
            watch(&mut conn, &key_names).await?;
            let mut types = redis::pipe();
            for key in &key_names {
                types.cmd("TYPE").arg(*key);
            }
            let reply: redis::RedisResult<Vec<String>> = types.query_async(&mut conn).await;
            let kinds = or_unwatch(&mut conn, reply).await?;

            // A tombstone blocks the dependency, any other string is replaced by the set.
            let strings: Vec<&str> = key_names
                .iter()
                .zip(&kinds)
                .filter(|(_, kind)| kind.as_str() == "string")
                .map(|(k, _)| *k)
                .collect();
            if !strings.is_empty() {
                let reply: redis::RedisResult<Vec<Option<String>>> = conn.mget(&strings).await;
                let current = or_unwatch(&mut conn, reply).await?;
                if current.iter().flatten().any(|v| is_tombstone(v)) {
                    unwatch(&mut conn).await;
                    debug!(cache = %self.name, keys = ?strings, "dependency key is tombstoned");
                    return Err(CacheError::TombstonedDependency);
                }
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            if !strings.is_empty() {
                pipe.cmd("DEL").arg(&strings).ignore();
            }
            for key in &key_names {
                pipe.cmd("SADD").arg(*key).arg(&members).ignore();
                pexpire(&mut pipe, key, ttl);
            }
            match exec(&mut conn, &pipe).await {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(CacheError::Redis(e)) if is_wrong_type(&e) => {
                    return Err(CacheError::TombstonedDependency);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::retries_exhausted("AddDependency"))
    }

    async fn clear_dependencies(&self, key: &Key, set_tombstone: bool) -> Result<()> {
        check_prefix(&self.options.key_prefix, [key])?;
        if self.options.read_only {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        for _ in 0..self.options.max_retries {
            watch(&mut conn, &[key.as_str()]).await?;
            let reply: redis::RedisResult<String> =
                redis::cmd("TYPE").arg(key.as_str()).query_async(&mut conn).await;
            let kind = or_unwatch(&mut conn, reply).await?;
            let members: Vec<String> = match kind.as_str() {
                "set" => {
                    let reply: redis::RedisResult<Vec<String>> =
                        conn.smembers(key.as_str()).await;
                    or_unwatch(&mut conn, reply).await?
                }
                "string" => {
                    let reply: redis::RedisResult<Option<String>> = conn.get(key.as_str()).await;
                    let value = or_unwatch(&mut conn, reply).await?;
                    if value.as_deref().is_some_and(is_tombstone) {
                        unwatch(&mut conn).await;
                        return Ok(());
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            if !members.is_empty() {
                pipe.cmd("DEL").arg(&members).ignore();
            }
            if set_tombstone && self.tombstones_enabled() {
                let tombstone = Sentinel::tombstone();
                set_px(&mut pipe, key.as_str(), tombstone.as_str(), self.options.tombstone_ttl);
            } else {
                pipe.cmd("DEL").arg(key.as_str()).ignore();
            }
            if exec(&mut conn, &pipe).await? {
                debug!(cache = %self.name, key = %key, members = members.len(), set_tombstone, "cleared dependencies");
                return Ok(());
            }
        }
        Err(CacheError::retries_exhausted("ClearDependencies"))
    }

    async fn flush(&self, prefix: &str, flush_tombstones: bool) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let keys = self.scan(&mut conn, prefix).await?;
        let mut flushed = 0usize;
        for chunk in keys.chunks(SCAN_COUNT) {
            let targets: Vec<&String> = if flush_tombstones {
                chunk.iter().collect()
            } else {
                let values: Vec<Option<String>> = conn.mget(chunk).await?;
                chunk
                    .iter()
                    .zip(values)
                    .filter(|(_, v)| !v.as_deref().is_some_and(is_tombstone))
                    .map(|(k, _)| k)
                    .collect()
            };
            if targets.is_empty() {
                continue;
            }
            let _: () = conn.del(&targets).await?;
            flushed += targets.len();
        }
        info!(cache = %self.name, prefix, flushed, flush_tombstones, "flushed cache");
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
        let mut conn = self.conn().await?;
        let mut keys = self.scan(&mut conn, prefix).await?;
        keys.sort();
        info!(cache = %self.name, prefix, count = keys.len(), "logging cache contents");
        for key in keys {
            let kind: String = redis::cmd("TYPE").arg(&key).query_async(&mut conn).await?;
            match kind.as_str() {
                "set" => {
                    let members: Vec<String> = conn.smembers(&key).await?;
                    info!(cache = %self.name, key = %key, members = ?members, "cache set entry");
                }
                "string" => {
                    let value: Option<String> = conn.get(&key).await?;
                    info!(cache = %self.name, key = %key, value = ?value, "cache entry");
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn supports_rate_limits(&self) -> bool {
        true
    }

    async fn reserve_rate_limit_slot(
        &self,
        keys: &[RateLimitKey],
        limit: i64,
        ttl: Duration,
        take_slot: bool,
    ) -> Result<RateLimitReservation> {
        let Some(newest) = keys.last() else {
            return Err(CacheError::invalid_argument(
                "ReserveRateLimitSlot called with no keys",
            ));
        };
        check_prefix(&self.options.key_prefix, keys)?;
        let key_names: Vec<&str> = keys.iter().map(RateLimitKey::as_str).collect();
        let mut conn = self.conn().await?;
        let counts: Vec<Option<i64>> = conn.mget(&key_names).await?;
        let total: i64 = counts.iter().map(|c| c.unwrap_or(0)).sum();

        if !take_slot || self.options.read_only {
            return Ok(RateLimitReservation {
                reserved: total < limit,
                total_slots: total,
            });
        }
        if total >= limit {
            return Ok(RateLimitReservation {
                reserved: false,
                total_slots: total,
            });
        }

        // The bucket gets its TTL only when this reservation creates it.
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(newest.as_str())
            .arg(0)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .ignore()
            .incr(newest.as_str(), 1)
            .query_async(&mut conn)
            .await?;

        let previous = counts.last().copied().flatten().unwrap_or(0);
        let new_total = total - previous + count;
        if new_total > limit {
            let _: i64 = conn.decr(newest.as_str(), 1).await?;
            debug!(cache = %self.name, key = %newest, total, limit, "rate limit slot lost to a concurrent reservation");
            return Ok(RateLimitReservation {
                reserved: false,
                total_slots: total,
            });
        }
        Ok(RateLimitReservation {
            reserved: true,
            total_slots: new_total,
        })
    }

    async fn release_rate_limit_slot(&self, keys: &[RateLimitKey]) -> Result<i64> {
        check_prefix(&self.options.key_prefix, keys)?;
        if keys.is_empty() || self.options.read_only {
            return Ok(0);
        }
        let key_names: Vec<&str> = keys.iter().map(RateLimitKey::as_str).collect();
        let mut conn = self.conn().await?;
        let counts: Vec<Option<i64>> = conn.mget(&key_names).await?;
        let total: i64 = counts.iter().map(|c| c.unwrap_or(0).max(0)).sum();
        if total <= 0 {
            return Ok(0);
        }

        for (key, count) in key_names.iter().zip(&counts) {
            if count.unwrap_or(0) <= 0 {
                continue;
            }
            let remaining: i64 = conn.decr(*key, 1).await?;
            if remaining < 0 {
                let _: i64 = conn.incr(*key, 1).await?;
                continue;
            }
            return Ok(total - 1);
        }
        Ok(total)
    }
}
