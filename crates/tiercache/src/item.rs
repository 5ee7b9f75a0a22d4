//! Contracts an entity has to satisfy to be stored through the item API.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::key::{Key, RateLimitKey};

/// TTL value meaning "never cache this type".
pub const SKIP_CACHE_TTL: Duration = Duration::ZERO;

/// Validation hook run on every value read back from the cache.
pub trait Validateable {
    fn validate(&self) -> Result<(), String>;
}

/// Maps logical key ids onto namespaced key names.
pub trait KeyNameProvider: Send + Sync {
    /// Builds a key from a logical id and its components.
    fn key_name(&self, id: &str, components: &[&str]) -> Key;

    fn key_name_with_id(&self, id: &str, item_id: Uuid) -> Key {
        let item_id = item_id.to_string();
        self.key_name(id, &[item_id.as_str()])
    }

    fn key_name_with_string(&self, id: &str, name: &str) -> Key {
        self.key_name(id, &[name])
    }

    fn key_name_static(&self, id: &str) -> Key {
        self.key_name(id, &[])
    }

    /// Prefix shared by every key this provider produces.
    fn prefix(&self) -> &str;

    fn rate_limit_key_name(&self, id: &str, suffix: &str) -> RateLimitKey;

    fn all_key_ids(&self) -> Vec<String>;
}

/// Maps logical TTL ids onto durations.
pub trait TtlProvider: Send + Sync {
    fn ttl(&self, id: &str) -> Duration;
}

/// An entity that can be stored through [`Manager`](crate::Manager).
///
/// Only the primary key is mandatory. The other keys default to "none".
pub trait CacheableItem: Serialize + DeserializeOwned + Validateable + Send + Sync {
    /// Slot holding the serialized item.
    fn primary_key(&self, names: &dyn KeyNameProvider) -> Key;

    /// Alternate lookup paths that always mirror the primary value.
    fn secondary_keys(&self, _names: &dyn KeyNameProvider) -> Vec<Key> {
        Vec::new()
    }

    /// Slot holding (and locking) the collection of all items of this type.
    fn global_collection_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    /// Dependency key tracking cached pages of the global collection.
    fn global_collection_pages_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    /// Slot holding a collection owned by this item.
    fn per_item_collection_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    /// Set of keys torn down when this item changes.
    fn dependencies_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    /// Dependencies keys of other items this item registers itself into.
    fn dependency_keys(&self, _names: &dyn KeyNameProvider) -> Vec<Key> {
        Vec::new()
    }

    fn is_modified_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    fn is_modified_collection_key(&self, _names: &dyn KeyNameProvider) -> Option<Key> {
        None
    }

    /// TTL of every cached value of this type.
    fn ttl(ttls: &dyn TtlProvider) -> Duration;
}

/// An entity whose usage is counted in time buckets.
pub trait RateLimitableItem: Validateable + Send + Sync {
    /// Bucket keys ordered from oldest to newest.
    fn rate_limit_keys(&self, names: &dyn KeyNameProvider) -> Vec<RateLimitKey>;

    fn rate_limit(&self) -> i64;

    fn ttl(&self, ttls: &dyn TtlProvider) -> Duration;
}
