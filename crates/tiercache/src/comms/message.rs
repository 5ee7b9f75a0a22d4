//! Wire format of invalidation messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::key::Key;

/// Key suffix asking subscribers to flush every key with the prefix.
pub const FLUSH_SUFFIX: &str = "*";
/// Key suffix asking subscribers to clear a dependency set and tombstone it.
pub const CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX: &str = "?T";
/// Key suffix asking subscribers to clear a dependency set.
pub const CLEAR_DEPENDENCIES_SUFFIX: &str = "?F";
/// Key suffix asking subscribers to log their keys with the prefix.
pub const LOG_SUFFIX: &str = "~";

/// How subscribers should treat a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageCode {
    /// Replay the invalidation, then run handlers.
    #[default]
    Invalidate,
    /// Only handlers-only subscribers act on it.
    HandlersOnly,
    /// Handlers-only message travelling between regions.
    GlobalHandlersOnly,
}

/// Invalidation broadcast between caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidateMessage {
    pub sender_id: Uuid,
    pub keys: Vec<Key>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub region: String,
    #[serde(default)]
    pub code: MessageCode,
    /// Channel of the sub-cache the message should be routed to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub route: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
}

impl InvalidateMessage {
    pub fn new(sender_id: Uuid, keys: Vec<Key>, region: impl Into<String>) -> Self {
        Self {
            sender_id,
            keys,
            timestamp: OffsetDateTime::now_utc(),
            region: region.into(),
            code: MessageCode::default(),
            route: String::new(),
            filters: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Time since the message was created. Zero when clocks disagree.
    pub fn latency(&self) -> Duration {
        Duration::try_from(OffsetDateTime::now_utc() - self.timestamp).unwrap_or(Duration::ZERO)
    }
}

/// Removes the operation suffix from a message key.
pub fn strip_suffix(key: &str) -> &str {
    [
        FLUSH_SUFFIX,
        CLEAR_DEPENDENCIES_TOMBSTONE_SUFFIX,
        CLEAR_DEPENDENCIES_SUFFIX,
        LOG_SUFFIX,
    ]
    .iter()
    .find_map(|suffix| key.strip_suffix(suffix))
    .unwrap_or(key)
}

/// Whether a message for `keys` concerns a sub-cache with `filters`.
///
/// No filters matches everything, and so does a flush.
pub fn filter_keys(keys: &[Key], filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    keys.iter().any(|k| {
        k.as_str().ends_with(FLUSH_SUFFIX) || filters.iter().any(|f| k.as_str().contains(f.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json() {
        let mut msg = InvalidateMessage::new(Uuid::new_v4(), vec![Key::from("k1")], "us-east");
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"code\":\"invalidate\""));
        assert!(!json.contains("route"));

        msg.code = MessageCode::GlobalHandlersOnly;
        msg.route = "sub".into();
        msg.filters = vec!["user".into()];
        let decoded = InvalidateMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded.code, MessageCode::GlobalHandlersOnly);
        assert_eq!(decoded.route, "sub");
        assert_eq!(decoded.keys, msg.keys);
    }

    #[test]
    fn test_missing_optional_fields() {
        let json = format!(
            r#"{{"sender_id":"{}","keys":["a"],"timestamp":"2024-05-01T10:00:00Z","region":"eu"}}"#,
            Uuid::nil()
        );
        let msg = InvalidateMessage::from_json(&json).unwrap();
        assert_eq!(msg.code, MessageCode::Invalidate);
        assert!(msg.route.is_empty());
        assert!(msg.filters.is_empty());
        assert!(msg.latency() > Duration::ZERO);
    }

    #[test]
    fn test_strip_suffix() {
        assert_eq!(strip_suffix("prefix_*"), "prefix_");
        assert_eq!(strip_suffix("deps?T"), "deps");
        assert_eq!(strip_suffix("deps?F"), "deps");
        assert_eq!(strip_suffix("prefix~"), "prefix");
        assert_eq!(strip_suffix("plain"), "plain");
    }

    #[test]
    fn test_filter_keys() {
        let keys = [Key::from("app_user_1"), Key::from("app_org_2")];
        assert!(filter_keys(&keys, &[]));
        assert!(filter_keys(&keys, &["user".into()]));
        assert!(!filter_keys(&keys, &["group".into()]));
        assert!(filter_keys(&[Key::from("app_*")], &["group".into()]));
    }
}
