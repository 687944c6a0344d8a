//! WebSocket transport (§4.2).
//!
//! A single background task owns the socket for the transport's entire
//! lifetime: it dials, runs the read/write loop, and on disconnect
//! reconnects with exponential backoff (×1.5 per attempt) without tearing
//! down or resubscribing its own event stream. That stream is created once
//! in [`WsTransport::new`] and handed to the dispatcher via `take_events`,
//! so a reconnect never produces a duplicate listener.
//!
//! A heartbeat timer fires every `heartbeat_interval` and, once a client id
//! is known (via [`Transport::set_client_id`]), sends a minimal
//! `/meta/connect` to keep the socket alive. A heartbeat send failure is
//! reported as a transport error but does not close the socket — the read
//! half is what decides whether the connection is actually dead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Transport, TransportEvent, TransportStats, TransportStatsSnapshot};
use crate::error::{BayeuxError, Result};
use crate::message::{connect_envelope, extract_bayeux_message_str, ConnectionType};

enum WsCommand {
    Send(Value),
    Close,
}

/// A Bayeux transport backed by a long-lived WebSocket connection.
///
/// Custom headers (auth tokens, cookies) belong on [`super::HttpTransport`];
/// most Bayeux servers authenticate the WebSocket upgrade via a query
/// parameter baked into `url` or via the `ext` field of the first message
/// sent on the new connection, so this transport dials a plain URL.
pub struct WsTransport {
    url: Url,
    commands: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
    connected: Arc<AtomicBool>,
    timeout: Mutex<Duration>,
    stats: Arc<TransportStats>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    max_reconnect_attempts: usize,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
    client_id: Arc<Mutex<Option<String>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(
        url: Url,
        max_reconnect_attempts: usize,
        reconnect_delay: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        Self {
            url,
            commands: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            timeout: Mutex::new(Duration::from_secs(30)),
            stats: Arc::new(TransportStats::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            max_reconnect_attempts,
            reconnect_delay,
            heartbeat_interval,
            client_id: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WebSocket
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<()> {
        if self.commands.lock().expect("commands mutex poisoned").is_some() {
            return Ok(());
        }
        let url = self.url.clone();
        let (commands_tx, commands_rx) = mpsc::unbounded();
        *self.commands.lock().expect("commands mutex poisoned") = Some(commands_tx);

        let connected = self.connected.clone();
        let stats = self.stats.clone();
        let events_tx = self.events_tx.clone();
        let max_attempts = self.max_reconnect_attempts;
        let mut delay = self.reconnect_delay;
        let heartbeat_interval = self.heartbeat_interval;
        let client_id = self.client_id.clone();

        let handle = tokio::spawn(async move {
            run_actor(
                url,
                commands_rx,
                connected,
                stats,
                events_tx,
                max_attempts,
                &mut delay,
                heartbeat_interval,
                client_id,
            )
            .await;
        });
        *self.task.lock().expect("task mutex poisoned") = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(commands) = self.commands.lock().expect("commands mutex poisoned").take() {
            let _ = commands.unbounded_send(WsCommand::Close);
        }
        if let Some(handle) = self.task.lock().expect("task mutex poisoned").take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        let commands = self.commands.lock().expect("commands mutex poisoned").clone();
        match commands {
            Some(commands) => {
                self.stats.record_sent();
                commands
                    .unbounded_send(WsCommand::Send(envelope))
                    .map_err(|_| BayeuxError::Closed)
            }
            None => Err(BayeuxError::Closed),
        }
    }

    async fn send_batch(&self, envelopes: Vec<Value>) -> Result<()> {
        for envelope in envelopes {
            self.send(envelope).await?;
        }
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

    fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.lock().expect("client_id mutex poisoned") = client_id;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_actor(
    url: Url,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    connected: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    max_attempts: usize,
    base_delay: &mut Duration,
    heartbeat_interval: Duration,
    client_id: Arc<Mutex<Option<String>>>,
) {
    let mut attempt = 0usize;
    let mut delay = *base_delay;

    'outer: loop {
        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _response)) => socket,
            Err(err) => {
                stats.record_error();
                let _ = events_tx.unbounded_send(TransportEvent::Error(err.to_string()));
                attempt += 1;
                if attempt > max_attempts {
                    let _ = events_tx.unbounded_send(TransportEvent::Disconnected);
                    break 'outer;
                }
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(1.5);
                continue 'outer;
            }
        };

        if attempt > 0 {
            stats.record_reconnect();
        }
        attempt = 0;
        delay = *base_delay;
        connected.store(true, Ordering::Release);
        let _ = events_tx.unbounded_send(TransportEvent::Connected);

        let (mut write, mut read) = socket.split();
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await; // interval ticks immediately; consume that tick so the first real beat waits a full interval
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let maybe_id = client_id.lock().expect("client_id mutex poisoned").clone();
                    if let Some(id) = maybe_id {
                        let envelope = connect_envelope(&id, ConnectionType::WebSocket, None);
                        let text = serde_json::to_string(&envelope).unwrap_or_default();
                        if let Err(err) = write.send(Message::Text(text)).await {
                            stats.record_error();
                            let _ = events_tx.unbounded_send(TransportEvent::Error(format!("heartbeat failed: {err}")));
                        }
                    }
                },
                command = commands.next() => match command {
                    Some(WsCommand::Send(envelope)) => {
                        let text = serde_json::to_string(&envelope).unwrap_or_default();
                        if let Err(err) = write.send(Message::Text(text)).await {
                            stats.record_error();
                            let _ = events_tx.unbounded_send(TransportEvent::Error(err.to_string()));
                        }
                    }
                    Some(WsCommand::Close) => {
                        let _ = write.send(Message::Close(None)).await;
                        connected.store(false, Ordering::Release);
                        return;
                    }
                    None => {
                        connected.store(false, Ordering::Release);
                        return;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match extract_bayeux_message_str(&text) {
                            Ok(message) => {
                                stats.record_received();
                                let _ = events_tx.unbounded_send(TransportEvent::Message(message));
                            }
                            Err(err) => {
                                stats.record_error();
                                let _ = events_tx.unbounded_send(TransportEvent::Error(err.to_string()));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        connected.store(false, Ordering::Release);
        let _ = events_tx.unbounded_send(TransportEvent::Disconnected);
        attempt += 1;
        if attempt > max_attempts {
            break 'outer;
        }
        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(1.5);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let transport = WsTransport::new(
            Url::parse("ws://example.com/bayeux").unwrap(),
            5,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_before_connect_is_closed_error() {
        let transport = WsTransport::new(
            Url::parse("ws://example.com/bayeux").unwrap(),
            5,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        let err = transport.send(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, BayeuxError::Closed));
    }
}
