use super::{SentinelManager, SetDecision};
use crate::key::{Sentinel, SentinelType, is_lock_sentinel, is_read_sentinel, is_tombstone};

/// Strictly read-populated cache.
///
/// Create, Update and Delete all write a tombstone and always win. Only reads
/// take an optimistic earliest-wins lock and only reads store values.
#[derive(Debug, Clone, Copy, Default)]
pub struct TombstoneSentinelManager;

impl TombstoneSentinelManager {
    pub fn new() -> Self {
        Self
    }
}

impl SentinelManager for TombstoneSentinelManager {
    fn generate_sentinel(&self, stype: SentinelType) -> Sentinel {
        match stype {
            SentinelType::Read => Sentinel::read(),
            SentinelType::Create | SentinelType::Update | SentinelType::Delete => {
                Sentinel::tombstone()
            }
        }
    }

    fn can_always_set_sentinel(&self, new: &Sentinel) -> bool {
        is_tombstone(new.as_str())
    }

    fn can_set_sentinel_given_curr_val(&self, _curr: &str, new: &Sentinel) -> bool {
        !is_read_sentinel(new.as_str())
    }

    fn can_set_value(&self, curr: &str, _val: &str, sentinel: &Sentinel) -> SetDecision {
        if curr == sentinel.as_str() && is_read_sentinel(curr) {
            return SetDecision::Set;
        }
        if is_tombstone(curr) {
            return SetDecision::Refresh;
        }
        SetDecision::Skip
    }

    fn is_sentinel_value(&self, value: &str) -> bool {
        is_lock_sentinel(value) || is_tombstone(value)
    }
}
