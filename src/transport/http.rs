//! HTTP long-polling transport (§4.2). `connect()` probes the endpoint with
//! a `/meta/handshake` envelope before declaring itself connected, then
//! starts its own background poll task that keeps issuing `/meta/connect`
//! once a client id is known — the transport owns its polling cadence, the
//! dispatcher only ever sees the resulting `TransportEvent`s. Callback-polling
//! (JSONP) is out of scope for a native client and is not offered in
//! `supportedConnectionTypes`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use url::Url;

use super::{Transport, TransportEvent, TransportStats, TransportStatsSnapshot};
use crate::error::{BayeuxError, Result};
use crate::message::{connect_envelope, extract_bayeux_message, ConnectionType};

/// A Bayeux transport backed by HTTP long-polling.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Arc<Url>,
    connected: Arc<AtomicBool>,
    timeout: Arc<Mutex<Duration>>,
    polling_interval: Duration,
    stats: Arc<TransportStats>,
    client_id: Arc<Mutex<Option<String>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(url: Url, headers: &HashMap<String, String>, polling_interval: Duration) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| BayeuxError::protocol(format!("invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BayeuxError::protocol(format!("invalid header value for {key}: {e}")))?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(BayeuxError::Reqwest)?;
        let (events_tx, events_rx) = mpsc::unbounded();
        Ok(Self {
            client,
            url: Arc::new(url),
            connected: Arc::new(AtomicBool::new(false)),
            timeout: Arc::new(Mutex::new(Duration::from_secs(30))),
            polling_interval,
            stats: Arc::new(TransportStats::default()),
            client_id: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            poll_task: Mutex::new(None),
        })
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.unbounded_send(event);
    }

    async fn post(&self, body: Value) -> Result<Vec<Value>> {
        let timeout = *self.timeout.lock().expect("timeout mutex poisoned");
        post_json(&self.client, &self.url, timeout, body).await
    }

    /// Starts the background task that keeps a long-polling session alive
    /// once `connect()` has succeeded. A no-op if already running.
    fn spawn_poll_task(&self) {
        let mut task = self.poll_task.lock().expect("poll mutex poisoned");
        if task.is_some() {
            return;
        }
        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout.clone();
        let connected = self.connected.clone();
        let stats = self.stats.clone();
        let client_id = self.client_id.clone();
        let events_tx = self.events_tx.clone();
        let polling_interval = self.polling_interval.max(Duration::from_millis(1));

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(polling_interval).await;
                if !connected.load(Ordering::Acquire) {
                    return;
                }
                let Some(id) = client_id.lock().expect("client_id mutex poisoned").clone() else {
                    continue;
                };
                let envelope = connect_envelope(&id, ConnectionType::LongPolling, None);
                let request_timeout = *timeout.lock().expect("timeout mutex poisoned");
                match post_json(&client, &url, request_timeout, Value::Array(vec![envelope])).await {
                    Ok(messages) => {
                        for message in messages {
                            stats.record_received();
                            let _ = events_tx.unbounded_send(TransportEvent::Message(message));
                        }
                    }
                    Err(err) => {
                        stats.record_error();
                        let _ = events_tx.unbounded_send(TransportEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
        }));
    }
}

async fn post_json(client: &reqwest::Client, url: &Url, timeout: Duration, body: Value) -> Result<Vec<Value>> {
    let response = client
        .post(url.as_str())
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| BayeuxError::network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BayeuxError::Http { status: status.as_u16(), body });
    }

    let text = response.text().await.map_err(|e| BayeuxError::network(e.to_string()))?;
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(other) => Ok(vec![other]),
        Err(_) => {
            let single = extract_bayeux_message(&Value::String(text))?;
            Ok(vec![single])
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::LongPolling
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self) -> Result<()> {
        let probe = json!({
            "channel": "/meta/handshake",
            "version": "1.0",
            "supportedConnectionTypes": ["long-polling"],
            "id": "0",
        });
        let messages = self.post(probe).await?;
        let successful =
            messages.first().and_then(|m| m.get("successful")).and_then(Value::as_bool).unwrap_or(false);
        if !successful {
            let err = messages
                .first()
                .and_then(|m| m.get("error"))
                .map(BayeuxError::from_response_error)
                .unwrap_or_else(|| BayeuxError::protocol("handshake probe rejected"));
            return Err(err);
        }

        self.connected.store(true, Ordering::Release);
        self.emit(TransportEvent::Connected);
        self.spawn_poll_task();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.poll_task.lock().expect("poll mutex poisoned").take() {
            task.abort();
        }
        self.connected.store(false, Ordering::Release);
        self.emit(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send(&self, envelope: Value) -> Result<()> {
        self.send_batch(vec![envelope]).await
    }

    async fn send_batch(&self, envelopes: Vec<Value>) -> Result<()> {
        self.stats.record_sent();
        match self.post(Value::Array(envelopes)).await {
            Ok(messages) => {
                for message in messages {
                    self.stats.record_received();
                    self.emit(TransportEvent::Message(message));
                }
                Ok(())
            }
            Err(err) => {
                self.stats.record_error();
                self.connected.store(false, Ordering::Release);
                self.emit(TransportEvent::Error(err.to_string()));
                Err(err)
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_with_empty_headers() {
        let url = Url::parse("https://example.com/bayeux").unwrap();
        let transport = HttpTransport::new(url, &HashMap::new(), Duration::from_millis(0)).unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.statistics(), TransportStatsSnapshot::default());
    }

    #[test]
    fn rejects_invalid_header_names() {
        let url = Url::parse("https://example.com/bayeux").unwrap();
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_owned(), "x".to_owned());
        assert!(HttpTransport::new(url, &headers, Duration::from_millis(0)).is_err());
    }
}
