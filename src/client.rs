//! The public entry point (§4.4): owns the subscription registry and wires
//! inbound dispatcher messages to the right callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, SessionState};
use crate::error::{BayeuxError, Result};
use crate::extension::FayeExtension;
use crate::message::Advice;
use crate::publication::Publication;
use crate::subscription::{Subscription, SubscriptionCallback};
use crate::transport::{Transport, TransportStatsSnapshot};

/// A Bayeux client: one dispatcher plus the registry of live subscriptions
/// it fans inbound messages out to. The dispatcher may hold several
/// registered transports (§4.2/§4.3); the client only ever talks to
/// whichever one is current.
pub struct Client {
    dispatcher: Arc<Dispatcher>,
    subscriptions: Mutex<HashMap<Uuid, Arc<Subscription>>>,
    router_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A snapshot of everything about a [`Client`] worth reporting at once
/// (§4.4): session state, identity, the active transport, and current
/// counters.
#[derive(Debug, Clone)]
pub struct ClientStatistics {
    pub state: SessionState,
    pub client_id: Option<String>,
    pub transport: String,
    pub subscription_count: usize,
    pub advice: Advice,
    pub transport_stats: TransportStatsSnapshot,
}

impl Client {
    /// Builds a client over a single `transport`, without connecting.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Arc<Self> {
        Self::with_transports(vec![transport], config)
    }

    /// Builds a client that can switch between several registered
    /// transports (§4.2 step 3, §4.4 `Client::set_transport`).
    pub fn with_transports(transports: Vec<Arc<dyn Transport>>, config: ClientConfig) -> Arc<Self> {
        let dispatcher = Dispatcher::with_transports(transports, config);
        Arc::new(Self {
            dispatcher,
            subscriptions: Mutex::new(HashMap::new()),
            router_handle: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        self.dispatcher.state()
    }

    pub fn client_id(&self) -> Option<String> {
        self.dispatcher.client_id()
    }

    /// Switches the active transport by its Bayeux connection-type name
    /// (`"long-polling"`, `"websocket"`). Fails if `name` isn't registered.
    pub async fn set_transport(self: &Arc<Self>, name: &str) -> Result<()> {
        self.dispatcher.set_transport(name).await
    }

    /// A full snapshot of session state, identity, active transport,
    /// subscription count, advice, and transport counters.
    pub fn statistics(&self) -> ClientStatistics {
        ClientStatistics {
            state: self.state(),
            client_id: self.client_id(),
            transport: self.dispatcher.current_transport_name(),
            subscription_count: self.subscriptions.lock().expect("subscriptions mutex poisoned").len(),
            advice: self.dispatcher.advice(),
            transport_stats: self.dispatcher.statistics(),
        }
    }

    pub fn set_extension(&self, extension: Option<Arc<dyn FayeExtension>>) {
        self.dispatcher.set_extension(extension);
    }

    /// Connects, performs the handshake, and starts routing inbound
    /// messages to subscription callbacks.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.dispatcher.connect().await?;
        self.ensure_router();
        Ok(())
    }

    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        if let Some(handle) = self.router_handle.lock().expect("router mutex poisoned").take() {
            handle.abort();
        }
        for subscription in self.subscriptions.lock().expect("subscriptions mutex poisoned").values() {
            subscription.cancel();
        }
        self.dispatcher.disconnect().await
    }

    /// Subscribes to `channel_name`, invoking `callback` for each message
    /// delivered to it (including via pattern fan-out from a broader
    /// subscription, per §4.4).
    pub async fn subscribe(
        self: &Arc<Self>,
        channel_name: &str,
        callback: SubscriptionCallback,
    ) -> Result<Arc<Subscription>> {
        let channel = Channel::new(channel_name)?;
        let subscribing_while_connecting_or_connected =
            matches!(self.state(), SessionState::Connecting | SessionState::Connected);
        if !subscribing_while_connecting_or_connected {
            return Err(BayeuxError::protocol("cannot subscribe before connect() has started a session"));
        }

        self.dispatcher.subscribe(channel.as_str()).await?;
        let subscription = Arc::new(Subscription::new(channel, callback));
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .insert(subscription.id(), subscription.clone());
        Ok(subscription)
    }

    /// Unsubscribes and cancels every local [`Subscription`] on this channel
    /// or pattern.
    pub async fn unsubscribe(self: &Arc<Self>, channel_name: &str) -> Result<()> {
        let channel = Channel::new(channel_name)?;
        self.dispatcher.unsubscribe(channel.as_str()).await?;
        let mut subscriptions = self.subscriptions.lock().expect("subscriptions mutex poisoned");
        subscriptions.retain(|_, subscription| {
            let matches = subscription.channel() == &channel;
            if matches {
                subscription.cancel();
            }
            !matches
        });
        Ok(())
    }

    /// Publishes `data` on `channel_name`, returning a [`Publication`]
    /// describing the outcome.
    pub async fn publish(self: &Arc<Self>, channel_name: &str, data: Value) -> Result<Publication> {
        let channel = Channel::new(channel_name)?;
        let mut publication = Publication::new(channel.clone(), data.clone(), None);
        match self.dispatcher.publish(channel.as_str(), data, None).await {
            Ok(_) => publication.mark_successful(),
            Err(err) => publication.mark_failed(&err),
        }
        Ok(publication)
    }

    fn ensure_router(self: &Arc<Self>) {
        let mut handle = self.router_handle.lock().expect("router mutex poisoned");
        if handle.is_some() {
            return;
        }
        let Some(mut inbound) = self.dispatcher.inbound() else { return };
        let this = self.clone();
        *handle = Some(tokio::spawn(async move {
            use futures_util::StreamExt;
            while let Some(message) = inbound.next().await {
                this.route_inbound(message);
            }
        }));
    }

    fn route_inbound(self: &Arc<Self>, message: Value) {
        let Some(channel_name) = crate::message::channel_of(&message) else { return };
        if channel_name.starts_with("/meta/") {
            self.route_meta(channel_name, &message);
            return;
        }
        let Ok(channel) = Channel::new(channel_name) else { return };
        let data = message.get("data").cloned().unwrap_or(Value::Null);

        let subscriptions = self.subscriptions.lock().expect("subscriptions mutex poisoned");
        let mut delivered = 0usize;
        for subscription in subscriptions.values() {
            if subscription.active() && subscription.channel().matches(&channel) {
                subscription.handle_message(data.clone());
                delivered += 1;
            }
        }
        if delivered == 0 {
            tracing::debug!(channel = %channel, "message delivered to no active subscription");
        }
    }

    /// Routes a meta-channel envelope that reached the inbound pipeline —
    /// either a server push or a late/timed-out correlated reply (§5) —
    /// separately from ordinary channel fan-out (§4.4).
    fn route_meta(self: &Arc<Self>, channel_name: &str, message: &Value) {
        match channel_name {
            "/meta/connect" => {
                tracing::debug!("meta/connect received; re-arming keepalive");
                self.dispatcher.handle_meta_connect();
            }
            "/meta/subscribe" | "/meta/unsubscribe" => {
                tracing::debug!(channel = channel_name, successful = crate::message::is_successful(message), "meta subscription reply");
            }
            "/meta/disconnect" => {
                tracing::debug!("meta/disconnect received");
            }
            _ => {
                tracing::debug!(channel = channel_name, "unhandled meta message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConnectionType;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn connected_client() -> (Arc<Client>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(ConnectionType::LongPolling));
        let client = Client::new(transport.clone(), ClientConfig::new("https://example.com/bayeux"));

        let transport_clone = transport.clone();
        let driver = tokio::spawn(async move {
            loop {
                for envelope in transport_clone.drain_sent() {
                    let id = envelope["id"].as_str().unwrap().to_owned();
                    let channel = envelope["channel"].as_str().unwrap_or_default();
                    let response = match channel {
                        "/meta/handshake" => {
                            json!({"channel": "/meta/handshake", "successful": true, "clientId": "c1", "id": id})
                        }
                        "/meta/connect" => {
                            json!({"channel": "/meta/connect", "successful": true, "clientId": "c1", "id": id})
                        }
                        "/meta/subscribe" => {
                            json!({"channel": "/meta/subscribe", "successful": true, "clientId": "c1", "subscription": envelope["subscription"], "id": id})
                        }
                        _ => json!({"channel": channel, "successful": true, "clientId": "c1", "id": id}),
                    };
                    transport_clone.push_response(response);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        client.connect().await.unwrap();
        driver.abort();
        (client, transport)
    }

    #[tokio::test]
    async fn subscribe_then_receive_delivers_to_callback() {
        let (client, transport) = connected_client().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        client
            .subscribe(
                "/chat/room1",
                Box::new(move |_| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport.push_response(json!({"channel": "/chat/room1", "data": {"text": "hi"}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pattern_subscription_receives_matching_channel() {
        let (client, transport) = connected_client().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        client
            .subscribe(
                "/chat/*",
                Box::new(move |_| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport.push_response(json!({"channel": "/chat/room1", "data": {}}));
        transport.push_response(json!({"channel": "/other/room1", "data": {}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let (client, transport) = connected_client().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let subscription = client
            .subscribe(
                "/chat/room1",
                Box::new(move |_| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        subscription.cancel();

        transport.push_response(json!({"channel": "/chat/room1", "data": {}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
