//! Wire-level envelope helpers: advice, connection types, and the
//! Bayeux-shape normalizer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{BayeuxError, Result};

/// The maximum value a message id counter may reach before wrapping, per
/// §3's `messageIdCounter monotonic modulo 2^53-1` invariant (the largest
/// integer a double-precision float — and therefore a JS Bayeux peer — can
/// represent exactly).
pub const MAX_MESSAGE_ID: u64 = (1u64 << 53) - 1;

/// Generates the decimal-string message ids used for request/response
/// correlation (§4.3).
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    counter: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }

    /// Returns the next id, as a decimal string, wrapping modulo
    /// [`MAX_MESSAGE_ID`].
    pub fn next(&self) -> String {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let next = if current >= MAX_MESSAGE_ID { 0 } else { current + 1 };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next.to_string(),
                Err(observed) => current = observed,
            }
        }
    }
}

/// The server-advised reconnect strategy (§3 Advice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectAdvice {
    /// Reconnect without a fresh handshake.
    Retry,
    /// Reconnect must begin with a fresh handshake; the client id is stale.
    Handshake,
    /// Do not reconnect.
    None,
}

impl Default for ReconnectAdvice {
    fn default() -> Self {
        Self::Retry
    }
}

/// Server-supplied hints on reconnect behavior, polling interval, and
/// per-message timeout (§3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Advice {
    pub reconnect: ReconnectAdvice,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for Advice {
    fn default() -> Self {
        Self { reconnect: ReconnectAdvice::Retry, interval_ms: 0, timeout_ms: 60_000 }
    }
}

impl Advice {
    /// Merges a server-sent `advice` object into `self`, leaving any field
    /// the server omitted untouched.
    pub fn merge(&mut self, value: &Value) {
        if let Some(reconnect) = value.get("reconnect").and_then(Value::as_str) {
            self.reconnect = match reconnect {
                "retry" => ReconnectAdvice::Retry,
                "handshake" => ReconnectAdvice::Handshake,
                "none" => ReconnectAdvice::None,
                _ => self.reconnect,
            };
        }
        if let Some(interval) = value.get("interval").and_then(Value::as_u64) {
            self.interval_ms = interval;
        }
        if let Some(timeout) = value.get("timeout").and_then(Value::as_u64) {
            self.timeout_ms = timeout;
        }
    }
}

/// A Bayeux connection type, as named in `supportedConnectionTypes` and
/// `connectionType` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    LongPolling,
    CallbackPolling,
    WebSocket,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LongPolling => "long-polling",
            Self::CallbackPolling => "callback-polling",
            Self::WebSocket => "websocket",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "long-polling" => Some(Self::LongPolling),
            "callback-polling" => Some(Self::CallbackPolling),
            "websocket" => Some(Self::WebSocket),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds `{channel:"/meta/handshake", version:"1.0", supportedConnectionTypes:[...], id}`.
pub fn handshake_envelope(id: &str, supported: &[ConnectionType]) -> Value {
    json!({
        "channel": "/meta/handshake",
        "version": "1.0",
        "supportedConnectionTypes": supported.iter().map(ConnectionType::as_str).collect::<Vec<_>>(),
        "id": id,
    })
}

/// Builds `{channel:"/meta/connect", clientId, connectionType, id?}`.
pub fn connect_envelope(client_id: &str, connection_type: ConnectionType, id: Option<&str>) -> Value {
    let mut m = Map::new();
    m.insert("channel".into(), json!("/meta/connect"));
    m.insert("clientId".into(), json!(client_id));
    m.insert("connectionType".into(), json!(connection_type.as_str()));
    if let Some(id) = id {
        m.insert("id".into(), json!(id));
    }
    Value::Object(m)
}

/// Builds `{channel:"/meta/subscribe", clientId, subscription, id}`.
pub fn subscribe_envelope(client_id: &str, subscription: &str, id: &str) -> Value {
    json!({
        "channel": "/meta/subscribe",
        "clientId": client_id,
        "subscription": subscription,
        "id": id,
    })
}

/// Builds `{channel:"/meta/unsubscribe", clientId, subscription, id}`.
pub fn unsubscribe_envelope(client_id: &str, subscription: &str, id: &str) -> Value {
    json!({
        "channel": "/meta/unsubscribe",
        "clientId": client_id,
        "subscription": subscription,
        "id": id,
    })
}

/// Builds `{channel:"/meta/disconnect", clientId, id}`.
pub fn disconnect_envelope(client_id: &str, id: &str) -> Value {
    json!({
        "channel": "/meta/disconnect",
        "clientId": client_id,
        "id": id,
    })
}

/// Builds `{channel, clientId, data, id, ext?}` for a user publish.
pub fn publish_envelope(
    client_id: &str,
    channel: &str,
    data: Value,
    id: &str,
    ext: Option<Value>,
) -> Value {
    let mut m = Map::new();
    m.insert("channel".into(), json!(channel));
    m.insert("clientId".into(), json!(client_id));
    m.insert("data".into(), data);
    m.insert("id".into(), json!(id));
    if let Some(ext) = ext {
        m.insert("ext".into(), ext);
    }
    Value::Object(m)
}

/// Normalizes a Bayeux response into a single JSON object (§4.3).
///
/// Bayeux servers may reply with a single envelope object or with a (one- or
/// more- element) array of envelopes; this extracts the first object either
/// way. `response` may also be a raw JSON string, which is parsed first.
pub fn extract_bayeux_message(response: &Value) -> Result<Value> {
    match response {
        Value::Array(items) => match items.first() {
            Some(Value::Object(_)) => Ok(items[0].clone()),
            Some(_) => Err(BayeuxError::network("Response array's first element is not an object")),
            None => Err(BayeuxError::network("Empty response array")),
        },
        Value::Object(_) => Ok(response.clone()),
        Value::String(s) => extract_bayeux_message_str(s),
        _ => Err(BayeuxError::network("Response is neither an object nor an array")),
    }
}

/// As [`extract_bayeux_message`], but parses `raw` as JSON first.
pub fn extract_bayeux_message_str(raw: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| BayeuxError::network(format!("Failed to parse response: {e}")))?;
    if matches!(parsed, Value::String(_)) {
        // A string that decodes to another string would recurse forever;
        // treat as malformed rather than loop.
        return Err(BayeuxError::network("Failed to parse response: nested string payload"));
    }
    extract_bayeux_message(&parsed)
}

/// `true` if `envelope.successful == true`.
pub fn is_successful(envelope: &Value) -> bool {
    envelope.get("successful").and_then(Value::as_bool).unwrap_or(false)
}

/// The `channel` field, if present and a string.
pub fn channel_of(envelope: &Value) -> Option<&str> {
    envelope.get("channel").and_then(Value::as_str)
}

/// The `id` field, if present and a string.
pub fn id_of(envelope: &Value) -> Option<&str> {
    envelope.get("id").and_then(Value::as_str)
}

/// The `clientId` field, if present and a string.
pub fn client_id_of(envelope: &Value) -> Option<&str> {
    envelope.get("clientId").and_then(Value::as_str)
}

/// Builds a [`BayeuxError`] from a failed envelope's `error` field, if present.
pub fn error_of(envelope: &Value) -> Option<BayeuxError> {
    envelope.get("error").map(BayeuxError::from_response_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_generator_is_monotonic_and_wraps() {
        let gen = MessageIdGenerator::new();
        assert_eq!(gen.next(), "1");
        assert_eq!(gen.next(), "2");
        gen.counter.store(MAX_MESSAGE_ID, Ordering::Relaxed);
        assert_eq!(gen.next(), "0");
    }

    #[test]
    fn advice_defaults() {
        let advice = Advice::default();
        assert_eq!(advice.reconnect, ReconnectAdvice::Retry);
        assert_eq!(advice.interval_ms, 0);
        assert_eq!(advice.timeout_ms, 60_000);
    }

    #[test]
    fn advice_merges_partial_updates() {
        let mut advice = Advice::default();
        advice.merge(&json!({"reconnect": "handshake"}));
        assert_eq!(advice.reconnect, ReconnectAdvice::Handshake);
        assert_eq!(advice.interval_ms, 0, "untouched fields keep their prior value");

        advice.merge(&json!({"interval": 1000, "timeout": 45000}));
        assert_eq!(advice.interval_ms, 1000);
        assert_eq!(advice.timeout_ms, 45000);
        assert_eq!(advice.reconnect, ReconnectAdvice::Handshake);
    }

    #[test]
    fn extracts_object_from_array() {
        let response = json!([{"successful": true, "clientId": "c1"}]);
        let extracted = extract_bayeux_message(&response).unwrap();
        assert_eq!(extracted, json!({"successful": true, "clientId": "c1"}));
    }

    #[test]
    fn empty_array_is_a_network_error() {
        let err = extract_bayeux_message(&json!([])).unwrap_err();
        assert!(err.to_string().contains("Empty response array"));
    }

    #[test]
    fn non_json_string_is_a_network_error() {
        let err = extract_bayeux_message_str("not json").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn plain_object_passes_through() {
        let response = json!({"successful": true});
        assert_eq!(extract_bayeux_message(&response).unwrap(), response);
    }

    #[test]
    fn envelope_accessors() {
        let envelope = json!({
            "channel": "/meta/handshake",
            "id": "1",
            "clientId": "abc",
            "successful": true,
        });
        assert_eq!(channel_of(&envelope), Some("/meta/handshake"));
        assert_eq!(id_of(&envelope), Some("1"));
        assert_eq!(client_id_of(&envelope), Some("abc"));
        assert!(is_successful(&envelope));
    }
}
