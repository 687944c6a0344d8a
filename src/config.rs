//! Client configuration (ambient stack, SPEC_FULL §4.6).

use std::collections::HashMap;
use std::time::Duration;

use crate::message::ConnectionType;

/// Configuration for a [`crate::Client`], covering the numeric defaults from
/// §3/§4 plus the headers and endpoint that are necessarily
/// deployment-specific.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The Bayeux endpoint URL (e.g. `https://example.com/bayeux`).
    pub endpoint: String,
    /// Per-message await timeout, mirrored onto the active transport.
    pub timeout: Duration,
    /// HTTP long-polling interval.
    pub polling_interval: Duration,
    /// WebSocket heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum WebSocket reconnect attempts before giving up.
    pub max_reconnect_attempts: usize,
    /// Initial WebSocket reconnect delay; multiplied by 1.5 after each
    /// failed attempt.
    pub reconnect_delay: Duration,
    /// Connection types offered during handshake, in preference order.
    pub supported_connection_types: Vec<ConnectionType>,
    /// Extra headers sent with every HTTP request / WebSocket upgrade.
    pub headers: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(30),
            polling_interval: Duration::from_millis(0),
            heartbeat_interval: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(100),
            supported_connection_types: vec![ConnectionType::LongPolling, ConnectionType::WebSocket],
            headers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Starts a config for the given endpoint, with every other field at its
    /// spec default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Default::default() }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Reads overrides from `FAYE_ENDPOINT`, `FAYE_TIMEOUT_MS`,
    /// `FAYE_POLLING_INTERVAL_MS`, `FAYE_HEARTBEAT_INTERVAL_MS`,
    /// `FAYE_MAX_RECONNECT_ATTEMPTS`, and `FAYE_RECONNECT_DELAY_MS`. Any
    /// variable that is unset or fails to parse leaves the corresponding
    /// default untouched.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("FAYE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(ms) = env_u64("FAYE_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("FAYE_POLLING_INTERVAL_MS") {
            config.polling_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("FAYE_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("FAYE_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = n as usize;
        }
        if let Some(ms) = env_u64("FAYE_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_millis(100));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ClientConfig::new("https://example.com/bayeux")
            .with_timeout(Duration::from_secs(5))
            .with_header("X-Api-Key", "abc");
        assert_eq!(config.endpoint, "https://example.com/bayeux");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.headers.get("X-Api-Key"), Some(&"abc".to_owned()));
    }
}
