//! Subscription bookkeeping (§3).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::channel::Channel;

/// A callback invoked for each inbound message delivered to a subscription.
///
/// Boxed so the registry can hold a heterogeneous collection of closures;
/// `Send + Sync` because delivery happens from the client's routing task.
pub type SubscriptionCallback = Box<dyn Fn(Value) + Send + Sync>;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// A live subscription on a channel or pattern.
///
/// Created on a successful `/meta/subscribe` response, destroyed by
/// `cancel()` or by unsubscribing the channel. Counters mutate only via
/// [`Subscription::handle_message`] / [`Subscription::handle_error`].
pub struct Subscription {
    id: Uuid,
    channel: Channel,
    callback: SubscriptionCallback,
    active: AtomicBool,
    created_at: u64,
    last_used: AtomicU64,
    message_count: AtomicU64,
    error_count: AtomicU64,
}

impl Subscription {
    pub(crate) fn new(channel: Channel, callback: SubscriptionCallback) -> Self {
        let created_at = now_ms();
        Self {
            id: Uuid::new_v4(),
            channel,
            callback,
            active: AtomicBool::new(true),
            created_at,
            last_used: AtomicU64::new(created_at),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Marks this subscription inactive. An inactive subscription never
    /// invokes its callback again, even if it is still present in the
    /// registry momentarily during teardown.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Delivers `data` to the callback if the subscription is still active,
    /// bumping `message_count` and `last_used`. Callback panics are caught
    /// and counted as errors so a single misbehaving subscriber cannot break
    /// fan-out to the rest of the registry.
    pub(crate) fn handle_message(&self, data: Value) {
        if !self.active() {
            return;
        }
        self.last_used.store(now_ms(), Ordering::Release);
        let callback = std::panic::AssertUnwindSafe(&self.callback);
        let outcome = std::panic::catch_unwind(move || {
            let callback = callback;
            (callback.0)(data)
        });
        match outcome {
            Ok(()) => {
                self.message_count.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {
                tracing::warn!(subscription = %self.id, channel = %self.channel, "subscription callback panicked");
                self.handle_error();
            }
        }
    }

    /// Records a delivery error without touching `message_count`.
    pub(crate) fn handle_error(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.active())
            .field("message_count", &self.message_count())
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn delivers_and_counts_messages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let sub = Subscription::new(
            Channel::new("/chat/room1").unwrap(),
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sub.handle_message(Value::String("hi".into()));
        assert_eq!(sub.message_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inactive_subscription_never_invokes_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let sub = Subscription::new(
            Channel::new("/chat/room1").unwrap(),
            Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sub.cancel();
        sub.handle_message(Value::Null);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(sub.message_count(), 0);
    }

    #[test]
    fn panicking_callback_increments_error_count_not_message_count() {
        let sub = Subscription::new(
            Channel::new("/chat/room1").unwrap(),
            Box::new(|_| panic!("boom")),
        );
        sub.handle_message(Value::Null);
        assert_eq!(sub.message_count(), 0);
        assert_eq!(sub.error_count(), 1);
    }
}
