use super::{SentinelManager, SetDecision};
use crate::key::{
    Sentinel, SentinelType, is_delete_sentinel, is_lock_sentinel, is_read_sentinel, is_tombstone,
    is_write_sentinel,
};

/// Writers populate the cache directly.
///
/// Reads are earliest-wins and lose to any other operation. Writes may steal
/// read or write slots. Deletes always take the slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteThroughSentinelManager;

impl WriteThroughSentinelManager {
    pub fn new() -> Self {
        Self
    }
}

impl SentinelManager for WriteThroughSentinelManager {
    fn generate_sentinel(&self, stype: SentinelType) -> Sentinel {
        match stype {
            SentinelType::Read => Sentinel::read(),
            SentinelType::Create | SentinelType::Update => Sentinel::write(),
            SentinelType::Delete => Sentinel::delete(),
        }
    }

    fn can_always_set_sentinel(&self, new: &Sentinel) -> bool {
        is_delete_sentinel(new.as_str())
    }

    fn can_set_sentinel_given_curr_val(&self, curr: &str, new: &Sentinel) -> bool {
        if is_read_sentinel(new.as_str()) {
            return false;
        }
        if is_delete_sentinel(curr) || is_tombstone(curr) {
            return false;
        }
        true
    }

    fn can_set_value(&self, curr: &str, val: &str, sentinel: &Sentinel) -> SetDecision {
        let sentinel = sentinel.as_str();
        if curr == sentinel {
            return SetDecision::Set;
        }

        let writing = is_write_sentinel(sentinel);
        if writing && is_write_sentinel(curr) {
            if curr.contains(sentinel) {
                return SetDecision::Clear;
            }
            return SetDecision::Conflict;
        }
        if is_tombstone(curr) {
            return SetDecision::Refresh;
        }
        if writing && !is_lock_sentinel(curr) && curr != val {
            return SetDecision::Clear;
        }
        SetDecision::Skip
    }

    fn is_sentinel_value(&self, value: &str) -> bool {
        is_lock_sentinel(value) || is_tombstone(value)
    }
}
