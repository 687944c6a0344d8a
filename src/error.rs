use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// A Bayeux-level error object, as carried on a failed response's `error` field.
///
/// Bayeux servers are free to send either the legacy `"code:params:message"`
/// string form or a structured object; [`BayeuxErrorResponse::parse`] accepts
/// both and normalizes to this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BayeuxErrorResponse {
    pub code: i64,
    pub message: String,
    pub params: Option<Vec<String>>,
}

impl BayeuxErrorResponse {
    /// Parses an `error` field value, which may be a plain string in the
    /// legacy `"code:params:message"` form or a `{code,message,params?}` object.
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::parse_legacy_string(s),
            Value::Object(map) => {
                let code = map.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message =
                    map.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_owned();
                let params = map.get("params").and_then(Value::as_array).map(|a| {
                    a.iter().map(|v| v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string())).collect()
                });
                Self { code, message, params }
            }
            other => Self { code: 0, message: other.to_string(), params: None },
        }
    }

    fn parse_legacy_string(s: &str) -> Self {
        let mut parts = s.splitn(3, ':');
        let code = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let params_part = parts.next().unwrap_or_default();
        let message = parts.next().unwrap_or(s).to_owned();
        let params = if params_part.is_empty() {
            None
        } else {
            Some(params_part.split(',').map(str::to_owned).collect())
        };
        Self { code, message, params }
    }
}

impl fmt::Display for BayeuxErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(params) = &self.params {
            write!(f, " ({})", params.join(","))?;
        }
        Ok(())
    }
}

/// The taxonomy of errors this client can raise.
///
/// Codes follow the Bayeux error-code convention where one exists (`401`,
/// `403`, HTTP status passthrough, `408` for timeout); `000` covers every
/// transport-level failure that the protocol itself has no code for.
#[derive(Debug, Error)]
pub enum BayeuxError {
    /// Transport connect/send failure, no transport selected, or a malformed
    /// server response that could not even be shape-normalized.
    #[error("network error: {message}")]
    Network { message: String },

    /// A frame failed to parse, or a channel name was invalid at the client
    /// boundary.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The server rejected our credentials.
    #[error("authentication error: {0}")]
    Authentication(BayeuxErrorResponse),

    /// The server rejected a `/meta/subscribe` or a publish.
    #[error("subscription error: {0}")]
    Subscription(BayeuxErrorResponse),

    /// A non-200 HTTP response from the transport.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    /// The awaiter for a message timed out before a matching response arrived.
    #[error("408 Timeout: Message timeout: {message_id}")]
    Timeout { message_id: String },

    /// The caller referenced a channel name that fails the channel grammar.
    #[error("invalid channel {0:?}")]
    InvalidChannel(String),

    /// The caller asked for a transport name the dispatcher doesn't know.
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    /// Underlying JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Underlying HTTP client error.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// Underlying WebSocket error.
    #[cfg(feature = "ws")]
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The client was closed while the operation was outstanding.
    #[error("client closed")]
    Closed,
}

impl BayeuxError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn timeout(message_id: impl Into<String>) -> Self {
        Self::Timeout { message_id: message_id.into() }
    }

    /// Build a [`BayeuxError`] from a Bayeux response's `error` field, picking
    /// the `Authentication`/`Subscription` variant based on the error code.
    pub fn from_response_error(value: &Value) -> Self {
        let err = BayeuxErrorResponse::parse(value);
        match err.code {
            401 => Self::Authentication(err),
            403 => Self::Subscription(err),
            _ => Self::Protocol { message: err.to_string() },
        }
    }

    /// `true` if this is a [`BayeuxError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// `true` if this is a [`BayeuxError::Network`] or an HTTP passthrough error.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Http { .. })
    }

    /// The numeric Bayeux-ish error code, for callers that want to branch on
    /// the taxonomy in §7 without matching on the enum directly.
    pub fn code(&self) -> i64 {
        match self {
            Self::Network { .. } | Self::Json(_) | Self::Reqwest(_) | Self::Closed => 0,
            #[cfg(feature = "ws")]
            Self::WebSocket(_) => 0,
            Self::Protocol { .. } | Self::InvalidChannel(_) | Self::UnknownTransport(_) => 400,
            Self::Authentication(_) => 401,
            Self::Subscription(_) => 403,
            Self::Http { status, .. } => *status as i64,
            Self::Timeout { .. } => 408,
        }
    }
}

pub type Result<T> = std::result::Result<T, BayeuxError>;
