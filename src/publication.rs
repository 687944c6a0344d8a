//! Publication bookkeeping (§3).

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::BayeuxError;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The outcome of a `publish()` call.
///
/// Terminal once either [`Publication::mark_successful`] or
/// [`Publication::mark_failed`] has been called; a second terminal
/// transition is a logic error (debug-asserted) rather than a silent
/// overwrite, matching §8's "forbidden by construction" invariant.
#[derive(Debug, Clone)]
pub struct Publication {
    id: Uuid,
    channel: Channel,
    data: Value,
    ext: Option<Value>,
    created_at: u64,
    completed_at: Option<u64>,
    successful: bool,
    error: Option<String>,
    subscriber_count: usize,
}

impl Publication {
    pub(crate) fn new(channel: Channel, data: Value, ext: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            data,
            ext,
            created_at: now_ms(),
            completed_at: None,
            successful: false,
            error: None,
            subscriber_count: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn ext(&self) -> Option<&Value> {
        self.ext.as_ref()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<u64> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    pub(crate) fn set_subscriber_count(&mut self, count: usize) {
        self.subscriber_count = count;
    }

    /// Transitions to `successful=true`. Panics in debug builds if already
    /// terminal; a no-op in release builds.
    pub(crate) fn mark_successful(&mut self) {
        debug_assert!(!self.is_terminal(), "publication is already terminal");
        if self.is_terminal() {
            return;
        }
        self.successful = true;
        self.completed_at = Some(now_ms());
    }

    /// Transitions to `error=Some(..)`. Panics in debug builds if already
    /// terminal; a no-op in release builds.
    pub(crate) fn mark_failed(&mut self, error: &BayeuxError) {
        debug_assert!(!self.is_terminal(), "publication is already terminal");
        if self.is_terminal() {
            return;
        }
        self.error = Some(error.to_string());
        self.completed_at = Some(now_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_non_terminal() {
        let pub_ = Publication::new(Channel::new("/chat/room1").unwrap(), Value::Null, None);
        assert!(!pub_.is_terminal());
        assert!(!pub_.successful());
        assert!(pub_.error().is_none());
    }

    #[test]
    fn mark_successful_is_terminal() {
        let mut pub_ = Publication::new(Channel::new("/chat/room1").unwrap(), Value::Null, None);
        pub_.mark_successful();
        assert!(pub_.is_terminal());
        assert!(pub_.successful());
        assert!(pub_.completed_at().is_some());
    }

    #[test]
    fn mark_failed_is_terminal() {
        let mut pub_ = Publication::new(Channel::new("/chat/room1").unwrap(), Value::Null, None);
        pub_.mark_failed(&BayeuxError::network("boom"));
        assert!(pub_.is_terminal());
        assert!(!pub_.successful());
        assert_eq!(pub_.error(), Some("network error: boom"));
    }

    #[test]
    #[should_panic(expected = "already terminal")]
    fn double_terminal_transition_panics_in_debug() {
        let mut pub_ = Publication::new(Channel::new("/chat/room1").unwrap(), Value::Null, None);
        pub_.mark_successful();
        pub_.mark_failed(&BayeuxError::network("boom"));
    }
}
