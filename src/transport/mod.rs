//! Transport abstraction (§4.2): the contract the dispatcher drives, plus
//! the two wire transports and a mock used by dispatcher/client tests.

mod http;
mod mock;
#[cfg(feature = "ws")]
mod ws;

pub use self::http::HttpTransport;
pub use mock::MockTransport;
#[cfg(feature = "ws")]
pub use ws::WsTransport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc;
use serde_json::Value;

use crate::error::Result;
use crate::message::ConnectionType;

/// An event pushed from a transport's background task to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A single normalized Bayeux envelope arrived.
    Message(Value),
    /// The transport established (or re-established) its connection.
    Connected,
    /// The transport lost its connection and will attempt to recover
    /// according to its own policy (reconnect backoff for WebSocket, the
    /// next poll for long-polling).
    Disconnected,
    /// A transport-level error occurred that the dispatcher should surface
    /// without necessarily tearing down the session.
    Error(String),
}

/// Point-in-time counters describing a transport's activity, exposed via
/// [`Transport::statistics`].
#[derive(Debug, Default)]
pub struct TransportStats {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
}

impl TransportStats {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// An immutable copy of a [`TransportStats`] taken at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub reconnects: u64,
}

/// The contract the dispatcher drives against any connection-type
/// implementation (§4.2). A transport owns its own connection lifecycle;
/// the dispatcher only ever sees [`TransportEvent`]s and calls `send`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The Bayeux connection type this transport implements.
    fn connection_type(&self) -> ConnectionType;

    /// `true` once a connection attempt has succeeded and no disconnect has
    /// been observed since.
    fn is_connected(&self) -> bool;

    /// Establishes the connection (or, for polling transports, begins
    /// polling). Idempotent: calling `connect` while already connected is a
    /// no-op.
    async fn connect(&self) -> Result<()>;

    /// Tears the connection down. The transport may still be reused by
    /// calling `connect` again.
    async fn disconnect(&self) -> Result<()>;

    /// Sends a single Bayeux envelope.
    async fn send(&self, envelope: Value) -> Result<()>;

    /// Sends a batch of Bayeux envelopes, where the wire format supports it
    /// (a JSON array for HTTP; one or more frames for WebSocket).
    async fn send_batch(&self, envelopes: Vec<Value>) -> Result<()> {
        for envelope in envelopes {
            self.send(envelope).await?;
        }
        Ok(())
    }

    /// Takes ownership of the transport's event receiver. Returns `None` if
    /// already taken.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Current activity counters.
    fn statistics(&self) -> TransportStatsSnapshot;

    /// Per-message timeout used for requests issued on this transport.
    fn timeout(&self) -> Duration;

    /// Overrides the per-message timeout (e.g. from server advice).
    fn set_timeout(&self, timeout: Duration);

    /// Updates the client id used for any requests the transport issues on
    /// its own initiative (WebSocket heartbeats, HTTP long-poll
    /// continuation). No-op for transports that never self-originate
    /// requests.
    fn set_client_id(&self, _client_id: Option<String>) {}
}
