//! Key and sentinel types.
//!
//! A [`Sentinel`] is written into a cache slot while an operation is in
//! flight. Lock sentinels look like `sentinel_<kind>_<uuid>`. Tombstones look
//! like `Tombstone<uuid>` and outlive ordinary locks so that reads of a
//! recently invalidated slot bypass region-local caches.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SENTINEL_PREFIX: &str = "sentinel_";
const READ_PREFIX: &str = "sentinel_read_";
const WRITE_PREFIX: &str = "sentinel_write_";
const DELETE_PREFIX: &str = "sentinel_delete_";
const TOMBSTONE_PREFIX: &str = "Tombstone";

/// Namespaced name of a cache slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new key with `suffix` appended.
    pub fn with_suffix(&self, suffix: &str) -> Key {
        Key(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of a single rate-limit bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RateLimitKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind of operation a sentinel protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentinelType {
    Create,
    Update,
    Delete,
    Read,
}

impl fmt::Display for SentinelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Read => "read",
        };
        f.write_str(name)
    }
}

/// Lock marker or tombstone held by a cache slot.
///
/// The empty sentinel ([`Sentinel::NO_LOCK`]) means the lock was not acquired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sentinel(String);

impl Sentinel {
    /// Returned when a lock could not be taken.
    pub const NO_LOCK: Sentinel = Sentinel(String::new());

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn read() -> Self {
        Self(format!("{READ_PREFIX}{}", Uuid::new_v4()))
    }

    pub(crate) fn write() -> Self {
        Self(format!("{WRITE_PREFIX}{}", Uuid::new_v4()))
    }

    pub(crate) fn delete() -> Self {
        Self(format!("{DELETE_PREFIX}{}", Uuid::new_v4()))
    }

    /// Generates a fresh tombstone.
    pub fn tombstone() -> Self {
        Self(format!("{TOMBSTONE_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_no_lock(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Sentinel {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Sentinel {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for Sentinel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `value` is a tombstone.
pub fn is_tombstone(value: &str) -> bool {
    value.starts_with(TOMBSTONE_PREFIX)
}

/// Whether `value` is any lock sentinel (read, write, delete or a conflict marker).
pub fn is_lock_sentinel(value: &str) -> bool {
    value.starts_with(SENTINEL_PREFIX)
}

pub fn is_read_sentinel(value: &str) -> bool {
    value.starts_with(READ_PREFIX)
}

/// Write sentinels include conflict markers, which start with the first
/// writer's sentinel.
pub fn is_write_sentinel(value: &str) -> bool {
    value.starts_with(WRITE_PREFIX)
}

pub fn is_delete_sentinel(value: &str) -> bool {
    value.starts_with(DELETE_PREFIX)
}

/// Whether a successful `SetValue` under this sentinel must be broadcast to
/// other caches.
pub fn is_invalidating_sentinel(value: &str) -> bool {
    is_write_sentinel(value) || is_delete_sentinel(value) || is_tombstone(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_formats() {
        let read = Sentinel::read();
        assert!(is_read_sentinel(read.as_str()));
        assert!(is_lock_sentinel(read.as_str()));
        assert!(!is_invalidating_sentinel(read.as_str()));

        let write = Sentinel::write();
        assert!(is_write_sentinel(write.as_str()));
        assert!(is_invalidating_sentinel(write.as_str()));

        let delete = Sentinel::delete();
        assert!(is_delete_sentinel(delete.as_str()));

        let tombstone = Sentinel::tombstone();
        assert!(is_tombstone(tombstone.as_str()));
        assert!(!is_lock_sentinel(tombstone.as_str()));
        assert!(is_invalidating_sentinel(tombstone.as_str()));
    }

    #[test]
    fn test_conflict_marker_is_write_sentinel() {
        let first = Sentinel::write();
        let second = Sentinel::write();
        let marker = format!("{first}{second}");
        assert!(is_write_sentinel(&marker));
        assert!(marker.contains(second.as_str()));
    }

    #[test]
    fn test_no_lock() {
        assert!(Sentinel::NO_LOCK.is_no_lock());
        assert!(!Sentinel::write().is_no_lock());
    }

    #[test]
    fn test_key_serializes_as_string() {
        let key = Key::from("prefix_item_1");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"prefix_item_1\"");
        assert_eq!(key.with_suffix("*").as_str(), "prefix_item_1*");
    }
}
