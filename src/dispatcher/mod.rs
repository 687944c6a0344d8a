//! The session state machine and meta-channel protocol engine (§4.3).
//!
//! The dispatcher owns message id generation, advice, transport selection,
//! and request/response correlation. It knows nothing about subscription
//! callbacks or pattern matching — data messages it cannot correlate to a
//! pending request are forwarded on [`Dispatcher::inbound`] for the client
//! layer to fan out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::{mpsc, oneshot};
use futures_util::StreamExt;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{BayeuxError, Result};
use crate::extension::{apply_incoming, apply_outgoing, FayeExtension};
use crate::message::{
    self, connect_envelope, disconnect_envelope, handshake_envelope, subscribe_envelope,
    unsubscribe_envelope, Advice, MessageIdGenerator, ReconnectAdvice,
};
use crate::transport::{Transport, TransportEvent};

/// The Bayeux session's connection state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Disconnected,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
        }
    }
}

type Pending = oneshot::Sender<Result<Value>>;

/// Drives handshake, connect, subscribe, unsubscribe, and disconnect
/// exchanges over whichever registered [`Transport`] is currently active.
pub struct Dispatcher {
    transports: Mutex<HashMap<String, Arc<dyn Transport>>>,
    current: Mutex<String>,
    config: ClientConfig,
    state: AtomicU8,
    client_id: Mutex<Option<String>>,
    ids: MessageIdGenerator,
    advice: Mutex<Advice>,
    pending: Mutex<HashMap<String, Pending>>,
    extension: Mutex<Option<Arc<dyn FayeExtension>>>,
    inbound_tx: mpsc::UnboundedSender<Value>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    pump_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Builds a dispatcher over a single transport.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Arc<Self> {
        Self::with_transports(vec![transport], config)
    }

    /// Builds a dispatcher that can switch between several transports (§4.2,
    /// §4.3 step 3): the one matching the first entry of
    /// `config.supported_connection_types` that is actually registered
    /// starts out current; [`Dispatcher::set_transport`] and the
    /// handshake-driven auto-switch in [`Dispatcher::connect`] can move
    /// between the rest.
    pub fn with_transports(transports: Vec<Arc<dyn Transport>>, config: ClientConfig) -> Arc<Self> {
        assert!(!transports.is_empty(), "dispatcher requires at least one transport");
        let mut map = HashMap::new();
        for transport in transports {
            transport.set_timeout(config.timeout);
            map.insert(transport.connection_type().as_str().to_owned(), transport);
        }
        let current = config
            .supported_connection_types
            .iter()
            .map(|ct| ct.as_str().to_owned())
            .find(|name| map.contains_key(name))
            .unwrap_or_else(|| map.keys().next().cloned().expect("map is non-empty"));

        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        Arc::new(Self {
            transports: Mutex::new(map),
            current: Mutex::new(current),
            config,
            state: AtomicU8::new(SessionState::Unconnected.as_u8()),
            client_id: Mutex::new(None),
            ids: MessageIdGenerator::new(),
            advice: Mutex::new(Advice::default()),
            pending: Mutex::new(HashMap::new()),
            extension: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            pump_handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().expect("client_id mutex poisoned").clone()
    }

    pub fn statistics(&self) -> crate::transport::TransportStatsSnapshot {
        self.transport().statistics()
    }

    pub fn advice(&self) -> Advice {
        *self.advice.lock().expect("advice mutex poisoned")
    }

    /// The name of the currently active transport (its `ConnectionType` as a
    /// Bayeux wire string, e.g. `"long-polling"` or `"websocket"`).
    pub fn current_transport_name(&self) -> String {
        self.current.lock().expect("current mutex poisoned").clone()
    }

    pub fn set_extension(&self, extension: Option<Arc<dyn FayeExtension>>) {
        *self.extension.lock().expect("extension mutex poisoned") = extension;
    }

    /// Takes ownership of the stream of messages that could not be
    /// correlated to a pending request — i.e. server-pushed data messages.
    pub fn inbound(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.inbound_rx.lock().expect("inbound mutex poisoned").take()
    }

    fn extension_ref(&self) -> Option<Arc<dyn FayeExtension>> {
        self.extension.lock().expect("extension mutex poisoned").clone()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        let name = self.current_transport_name();
        self.transports
            .lock()
            .expect("transports mutex poisoned")
            .get(&name)
            .cloned()
            .expect("current transport is always registered")
    }

    /// Explicitly switches the active transport (SPEC_FULL §4.4
    /// `Client::set_transport`). Fails with [`BayeuxError::UnknownTransport`]
    /// if `name` isn't registered.
    pub async fn set_transport(self: &Arc<Self>, name: &str) -> Result<()> {
        if !self.transports.lock().expect("transports mutex poisoned").contains_key(name) {
            return Err(BayeuxError::UnknownTransport(name.to_owned()));
        }
        self.switch_transport(name).await
    }

    async fn switch_transport(self: &Arc<Self>, name: &str) -> Result<()> {
        if self.current_transport_name() == name {
            return Ok(());
        }
        let new_transport = self
            .transports
            .lock()
            .expect("transports mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BayeuxError::UnknownTransport(name.to_owned()))?;

        new_transport.set_timeout(self.transport().timeout());
        new_transport.set_client_id(self.client_id());

        let live = matches!(self.state(), SessionState::Connecting | SessionState::Connected);
        if live {
            let old_transport = self.transport();
            new_transport.connect().await?;
            let _ = old_transport.disconnect().await;
        }

        *self.current.lock().expect("current mutex poisoned") = name.to_owned();

        if live {
            self.rewire_pump();
        }
        Ok(())
    }

    /// §4.3 step 3: if the handshake response's first `supportedConnectionTypes`
    /// entry names a transport we own and it isn't already current, switch to it.
    async fn maybe_switch_transport(self: &Arc<Self>, handshake_response: &Value) {
        let Some(types) = handshake_response.get("supportedConnectionTypes").and_then(Value::as_array)
        else {
            return;
        };
        let Some(preferred) = types.first().and_then(Value::as_str) else { return };
        if preferred == self.current_transport_name() {
            return;
        }
        if !self.transports.lock().expect("transports mutex poisoned").contains_key(preferred) {
            return;
        }
        if let Err(err) = self.switch_transport(preferred).await {
            tracing::warn!(%err, transport = preferred, "failed to switch to server-preferred transport");
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Connecting);
        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<()> {
        self.transport().connect().await?;
        self.ensure_pump();

        let handshake_response = self.handshake().await?;
        if let Some(advice) = handshake_response.get("advice") {
            self.apply_advice(advice);
        }
        self.maybe_switch_transport(&handshake_response).await;

        self.set_state(SessionState::Connected);

        // Kicks off the first `/meta/connect`; fire-and-forget per §4.3 —
        // its (possibly long-delayed, for long-polling) reply arrives via
        // the inbound pipeline, not a second round-trip blocking `connect()`.
        if let Err(err) = self.send_connect().await {
            tracing::warn!(%err, "initial post-handshake connect failed");
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        if let Some(client_id) = self.client_id() {
            let id = self.ids.next();
            let envelope = disconnect_envelope(&client_id, &id);
            let _ = self.send_and_await(envelope).await;
        }
        self.transport().disconnect().await?;
        self.transport().set_client_id(None);
        *self.client_id.lock().expect("client_id mutex poisoned") = None;
        self.set_state(SessionState::Unconnected);
        Ok(())
    }

    async fn handshake(self: &Arc<Self>) -> Result<Value> {
        let id = self.ids.next();
        let envelope = handshake_envelope(&id, &self.config.supported_connection_types);
        let response = self.send_and_await(envelope).await?;
        if !message::is_successful(&response) {
            return Err(message::error_of(&response)
                .unwrap_or_else(|| BayeuxError::protocol("handshake failed")));
        }
        let client_id = message::client_id_of(&response)
            .ok_or_else(|| BayeuxError::protocol("handshake response missing clientId"))?
            .to_owned();
        *self.client_id.lock().expect("client_id mutex poisoned") = Some(client_id.clone());
        self.transport().set_client_id(Some(client_id));
        Ok(response)
    }

    /// The keepalive `/meta/connect` (§4.3): fire-and-forget, no awaiter —
    /// the response (if any) arrives via the inbound pipeline like any other
    /// unsolicited message and is routed by the client's meta handler.
    async fn send_connect(self: &Arc<Self>) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(BayeuxError::protocol("cannot send a keepalive connect outside the Connected state"));
        }
        let client_id = self
            .client_id()
            .ok_or_else(|| BayeuxError::protocol("cannot connect before a handshake assigns a clientId"))?;
        let id = self.ids.next();
        let envelope = connect_envelope(&client_id, self.transport().connection_type(), Some(&id));
        let envelope = apply_outgoing(self.extension_ref().as_deref(), envelope);
        self.transport().send(envelope).await
    }

    /// Invoked by the client's `/meta/connect` routing (§4.4) to re-arm the
    /// long-poll cycle: applies reconnect advice, waits out the advised
    /// interval, and sends the next keepalive connect.
    pub fn handle_meta_connect(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            if this.state() != SessionState::Connected {
                return;
            }
            let advice = this.advice();
            match advice.reconnect {
                ReconnectAdvice::None => return,
                ReconnectAdvice::Handshake => {
                    if this.handshake().await.is_err() {
                        return;
                    }
                }
                ReconnectAdvice::Retry => {}
            }
            let wait = Duration::from_millis(advice.interval_ms).max(this.config.polling_interval);
            tokio::time::sleep(wait).await;
            if this.state() != SessionState::Connected {
                return;
            }
            if let Err(err) = this.send_connect().await {
                tracing::warn!(%err, "keepalive connect failed");
            }
        });
    }

    #[tracing::instrument(skip(self))]
    pub async fn subscribe(self: &Arc<Self>, channel: &str) -> Result<Value> {
        let client_id = self
            .client_id()
            .ok_or_else(|| BayeuxError::protocol("cannot subscribe before a handshake assigns a clientId"))?;
        let id = self.ids.next();
        let envelope = subscribe_envelope(&client_id, channel, &id);
        let response = self.send_and_await(envelope).await?;
        if !message::is_successful(&response) {
            return Err(message::error_of(&response)
                .unwrap_or_else(|| BayeuxError::Subscription(crate::error::BayeuxErrorResponse {
                    code: 403,
                    message: format!("subscription to {channel} refused"),
                    params: None,
                })));
        }
        Ok(response)
    }

    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe(self: &Arc<Self>, channel: &str) -> Result<Value> {
        let client_id = self
            .client_id()
            .ok_or_else(|| BayeuxError::protocol("cannot unsubscribe before a handshake assigns a clientId"))?;
        let id = self.ids.next();
        let envelope = unsubscribe_envelope(&client_id, channel, &id);
        let response = self.send_and_await(envelope).await?;
        if !message::is_successful(&response) {
            return Err(message::error_of(&response).unwrap_or_else(|| {
                BayeuxError::Subscription(crate::error::BayeuxErrorResponse {
                    code: 403,
                    message: format!("unsubscribe from {channel} refused"),
                    params: None,
                })
            }));
        }
        Ok(response)
    }

    #[tracing::instrument(skip(self, data, ext))]
    pub async fn publish(self: &Arc<Self>, channel: &str, data: Value, ext: Option<Value>) -> Result<Value> {
        let client_id = self
            .client_id()
            .ok_or_else(|| BayeuxError::protocol("cannot publish before a handshake assigns a clientId"))?;
        let id = self.ids.next();
        let envelope = message::publish_envelope(&client_id, channel, data, &id, ext);
        let response = self.send_and_await(envelope).await?;
        if !message::is_successful(&response) {
            return Err(message::error_of(&response)
                .unwrap_or_else(|| BayeuxError::protocol(format!("publish to {channel} failed"))));
        }
        Ok(response)
    }

    async fn send_and_await(self: &Arc<Self>, envelope: Value) -> Result<Value> {
        let id = message::id_of(&envelope)
            .ok_or_else(|| BayeuxError::protocol("outgoing envelope missing id"))?
            .to_owned();
        let envelope = apply_outgoing(self.extension_ref().as_deref(), envelope);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending mutex poisoned").insert(id.clone(), tx);

        if let Err(err) = self.transport().send(envelope).await {
            self.pending.lock().expect("pending mutex poisoned").remove(&id);
            return Err(err);
        }

        let timeout = self.transport().timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BayeuxError::Closed),
            Err(_) => {
                self.pending.lock().expect("pending mutex poisoned").remove(&id);
                Err(BayeuxError::timeout(id))
            }
        }
    }

    fn ensure_pump(self: &Arc<Self>) {
        if self.pump_handle.lock().expect("pump mutex poisoned").is_some() {
            return;
        }
        self.rewire_pump();
    }

    /// Tears down the current event pump (if any) and spawns a fresh one
    /// over the now-current transport's event stream. Used both for the
    /// initial wiring and after a transport switch.
    fn rewire_pump(self: &Arc<Self>) {
        if let Some(handle) = self.pump_handle.lock().expect("pump mutex poisoned").take() {
            handle.abort();
        }
        let Some(mut events) = self.transport().take_events() else {
            tracing::warn!("no event stream available for the active transport (already taken)");
            return;
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                this.handle_transport_event(event);
            }
        });
        *self.pump_handle.lock().expect("pump mutex poisoned") = Some(handle);
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(raw) => self.handle_transport_message(raw),
            TransportEvent::Connected => {}
            TransportEvent::Disconnected => {
                if self.state() == SessionState::Connected {
                    self.set_state(SessionState::Disconnected);
                }
                self.fail_pending("transport disconnected");
            }
            TransportEvent::Error(message) => {
                tracing::warn!(%message, "transport error");
            }
        }
    }

    fn handle_transport_message(self: &Arc<Self>, raw: Value) {
        let message = apply_incoming(self.extension_ref().as_deref(), raw);

        if let Some(advice) = message.get("advice") {
            self.apply_advice(advice);
        }

        if let Some(id) = message::id_of(&message) {
            let sender = self.pending.lock().expect("pending mutex poisoned").remove(id);
            if let Some(sender) = sender {
                // Correlation only resolves *that a reply arrived*; whether it
                // counts as success is channel-specific and left to the caller
                // (handshake/subscribe/unsubscribe/publish each interpret
                // `successful` and build their own fallback error).
                let _ = sender.send(Ok(message.clone()));
                return;
            }
        }

        let _ = self.inbound_tx.unbounded_send(message);
    }

    /// Merges server advice and, only when the server actually named a new
    /// `timeout`, applies it to the active transport's per-message timeout
    /// (§4.3 Advice application, §4.6).
    fn apply_advice(&self, value: &Value) {
        self.advice.lock().expect("advice mutex poisoned").merge(value);
        if let Some(timeout_ms) = value.get("timeout").and_then(Value::as_u64) {
            self.transport().set_timeout(Duration::from_millis(timeout_ms));
        }
    }

    fn fail_pending(&self, message: &str) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(BayeuxError::network(message)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn config() -> ClientConfig {
        ClientConfig::new("https://example.com/bayeux")
    }

    #[tokio::test]
    async fn handshake_then_connect_transitions_to_connected() {
        let transport = Arc::new(MockTransport::new(crate::message::ConnectionType::LongPolling));
        let dispatcher = Dispatcher::new(transport.clone(), config());

        let dispatcher_clone = dispatcher.clone();
        let transport_clone = transport.clone();
        let driver = tokio::spawn(async move {
            loop {
                let sent = transport_clone.drain_sent();
                for envelope in sent {
                    let id = envelope["id"].as_str().unwrap().to_owned();
                    let response = if envelope["channel"] == "/meta/handshake" {
                        json!({"channel": "/meta/handshake", "successful": true, "clientId": "abc123", "id": id})
                    } else {
                        json!({"channel": "/meta/connect", "successful": true, "clientId": "abc123", "id": id})
                    };
                    transport_clone.push_response(response);
                }
                if dispatcher_clone.state() == SessionState::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        dispatcher.connect().await.unwrap();
        driver.abort();
        assert_eq!(dispatcher.state(), SessionState::Connected);
        assert_eq!(dispatcher.client_id().as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn subscribe_without_clientid_is_an_error() {
        let transport = Arc::new(MockTransport::new(crate::message::ConnectionType::LongPolling));
        let dispatcher = Dispatcher::new(transport, config());
        let err = dispatcher.subscribe("/chat/room1").await.unwrap_err();
        assert!(err.to_string().contains("clientId"));
    }

    #[tokio::test]
    async fn set_transport_rejects_unknown_name() {
        let transport = Arc::new(MockTransport::new(crate::message::ConnectionType::LongPolling));
        let dispatcher = Dispatcher::new(transport, config());
        let err = dispatcher.set_transport("carrier-pigeon").await.unwrap_err();
        assert!(matches!(err, BayeuxError::UnknownTransport(name) if name == "carrier-pigeon"));
    }

    #[tokio::test]
    async fn set_transport_switches_current_before_connect() {
        let long_polling = Arc::new(MockTransport::new(crate::message::ConnectionType::LongPolling));
        let websocket = Arc::new(MockTransport::new(crate::message::ConnectionType::WebSocket));
        let dispatcher =
            Dispatcher::with_transports(vec![long_polling, websocket], config());
        assert_eq!(dispatcher.current_transport_name(), "long-polling");
        dispatcher.set_transport("websocket").await.unwrap();
        assert_eq!(dispatcher.current_transport_name(), "websocket");
    }
}
