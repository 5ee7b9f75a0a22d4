//! Lock policies.
//!
//! A [`SentinelManager`] is a pure policy object: providers consult it to
//! decide whether a sentinel may be written over a slot's current value and
//! what a conditional `SetValue` should do. Two strategies exist:
//!
//! - [`WriteThroughSentinelManager`]: writers populate the cache, a later
//!   writer may steal an earlier writer's slot and the earlier writer is told
//!   about the conflict instead of overwriting.
//! - [`TombstoneSentinelManager`]: every write tombstones the slot, only reads
//!   populate the cache.

mod tombstone;
mod write_through;

pub use tombstone::TombstoneSentinelManager;
pub use write_through::WriteThroughSentinelManager;

use crate::key::{Sentinel, SentinelType};

/// Outcome of a conditional `SetValue` given the lock key's current content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDecision {
    /// The caller still owns the slot: store the value.
    Set,
    /// The stored data may be stale: wipe the keys.
    Clear,
    /// A newer writer took over: record the conflict in the slot.
    Conflict,
    /// The slot is tombstoned: only refresh its TTL.
    Refresh,
    /// Leave the slot alone.
    Skip,
}

/// Policy deciding how optimistic locks interact.
pub trait SentinelManager: Send + Sync {
    fn generate_sentinel(&self, stype: SentinelType) -> Sentinel;

    /// Whether `new` may be written regardless of the slot's current sentinel.
    fn can_always_set_sentinel(&self, new: &Sentinel) -> bool;

    /// Whether `new` may replace the sentinel `curr` currently in the slot.
    fn can_set_sentinel_given_curr_val(&self, curr: &str, new: &Sentinel) -> bool;

    fn can_set_value(&self, curr: &str, val: &str, sentinel: &Sentinel) -> SetDecision;

    fn is_sentinel_value(&self, value: &str) -> bool;
}
