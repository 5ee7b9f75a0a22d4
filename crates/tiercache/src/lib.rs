//! # tiercache
//!
//! Optimistically-concurrent cache kept in front of a database, with an
//! optional in-memory tier and invalidation across machines and regions.
//!
//! Writers and readers take short-lived locks ("sentinels") on the slots they
//! are about to fill. A value only lands in the cache if the slot still holds
//! the caller's sentinel, so a slow reader can't overwrite a newer write.
//! Deletes leave tombstones behind for a while so stale readers can't
//! resurrect deleted items.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌─────────────────────────┐
//!                      │         Manager         │  item API + rate limits
//!                      └────────────┬────────────┘
//!                                   │ dyn Provider
//!                      ┌────────────▼────────────┐
//!                      │     LayeringWrapper     │  optional
//!                      └──────┬───────────┬──────┘
//!                             │           │
//!              ┌──────────────▼──┐     ┌──▼──────────────┐
//!              │  Invalidation   │     │  Invalidation   │
//!              │  (on machine)   │     │  (regional)     │
//!              └──────┬──────────┘     └──────────┬──────┘
//!                     │                           │
//!              InMemoryProvider            RedisProvider
//!                     ▲                           │
//!                     └──── pub/sub channel ◀─────┘
//! ```
//!
//! ## Modules
//!
//! - [`key`] - keys, sentinels and tombstones
//! - [`sentinel`] - lock policies
//! - [`provider`] - the storage boundary, in-memory and Redis backends
//! - [`layering`] - two providers stacked as one
//! - [`comms`] - pub/sub transport for invalidation messages
//! - [`invalidation`] - broadcasting writes, the cross-region relay
//! - [`manager`] - the generic item API
//! - [`rate_limit`] - bucketed rate limiting
//! - [`config`] - configuration loading

pub mod comms;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod item;
pub mod key;
pub mod layering;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod sentinel;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use invalidation::{
    CacheOptions, CrossRegionRelay, InvalidationOptions, InvalidationWrapper,
    initialize_invalidating_cache_from_config, run_cross_region_invalidations,
    run_in_region_local_handlers_subscriber,
};
pub use item::{CacheableItem, KeyNameProvider, RateLimitableItem, TtlProvider, Validateable};
pub use key::{Key, RateLimitKey, Sentinel, SentinelType};
pub use layering::LayeringWrapper;
pub use manager::{ItemLookup, ItemsLookup, Manager};
pub use pool::ConnectionPools;
pub use provider::memory::InMemoryProvider;
pub use provider::redis::RedisProvider;
pub use provider::{CacheLookup, Provider, RateLimitReservation, SetOutcome};
pub use sentinel::{SentinelManager, TombstoneSentinelManager, WriteThroughSentinelManager};
