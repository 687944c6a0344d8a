//! In-memory transport for dispatcher/client unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc;
use serde_json::Value;

use super::{Transport, TransportEvent, TransportStats, TransportStatsSnapshot};
use crate::error::{BayeuxError, Result};
use crate::message::ConnectionType;

/// Records every envelope handed to `send`/`send_batch` and lets a test push
/// server responses onto the transport's event stream on its own schedule.
#[derive(Clone)]
pub struct MockTransport {
    connection_type: ConnectionType,
    connected: Arc<Mutex<bool>>,
    sent: Arc<Mutex<VecDeque<Value>>>,
    timeout: Arc<Mutex<Duration>>,
    stats: Arc<TransportStats>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>>,
    fail_sends: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new(connection_type: ConnectionType) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        Self {
            connection_type,
            connected: Arc::new(Mutex::new(false)),
            sent: Arc::new(Mutex::new(VecDeque::new())),
            timeout: Arc::new(Mutex::new(Duration::from_secs(30))),
            stats: Arc::new(TransportStats::default()),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            fail_sends: Arc::new(Mutex::new(false)),
        }
    }

    /// Queues a response to be delivered as a `TransportEvent::Message` the
    /// next time the test's event consumer polls.
    pub fn push_response(&self, response: Value) {
        self.stats.record_received();
        let _ = self.events_tx.unbounded_send(TransportEvent::Message(response));
    }

    pub fn push_disconnected(&self) {
        *self.connected.lock().expect("connected mutex poisoned") = false;
        let _ = self.events_tx.unbounded_send(TransportEvent::Disconnected);
    }

    /// Returns everything sent so far, in order, draining the queue.
    pub fn drain_sent(&self) -> Vec<Value> {
        self.sent.lock().expect("sent mutex poisoned").drain(..).collect()
    }

    /// Makes subsequent `send`/`send_batch` calls fail, simulating a dead
    /// connection.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().expect("fail_sends mutex poisoned") = fail;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().expect("connected mutex poisoned")
    }

    async fn connect(&self) -> Result<()> {
        *self.connected.lock().expect("connected mutex poisoned") = true;
        let _ = self.events_tx.unbounded_send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.connected.lock().expect("connected mutex poisoned") = false;
        let _ = self.events_tx.unbounded_send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        if *self.fail_sends.lock().expect("fail_sends mutex poisoned") {
            self.stats.record_error();
            return Err(BayeuxError::network("mock transport configured to fail sends"));
        }
        self.stats.record_sent();
        self.sent.lock().expect("sent mutex poisoned").push_back(envelope);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().expect("events mutex poisoned").take()
    }

    fn statistics(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("timeout mutex poisoned")
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().expect("timeout mutex poisoned") = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_sent_envelopes() {
        let transport = MockTransport::new(ConnectionType::LongPolling);
        transport.send(json!({"channel": "/meta/handshake"})).await.unwrap();
        let sent = transport.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["channel"], json!("/meta/handshake"));
    }

    #[tokio::test]
    async fn fail_sends_returns_error() {
        let transport = MockTransport::new(ConnectionType::LongPolling);
        transport.set_fail_sends(true);
        assert!(transport.send(json!({})).await.is_err());
    }
}
