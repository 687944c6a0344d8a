//! A client for the [Bayeux](https://docs.cometd.org/current/reference/#_bayeux) publish/subscribe
//! protocol, covering handshake, long-polling and WebSocket transports,
//! channel glob matching, and the extension pipeline.
//!
//! ```no_run
//! use faye::{Client, ClientConfig};
//! use faye::transport::HttpTransport;
//! use serde_json::json;
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn run() -> faye::Result<()> {
//! let config = ClientConfig::new("https://example.com/bayeux");
//! let transport = Arc::new(HttpTransport::new(
//!     Url::parse(&config.endpoint).unwrap(),
//!     &config.headers,
//!     config.polling_interval,
//! )?);
//! let client = Client::new(transport, config);
//! client.connect().await?;
//! client
//!     .subscribe("/chat/general", Box::new(|data| println!("{data}")))
//!     .await?;
//! client.publish("/chat/general", json!({"text": "hello"})).await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod client;
mod config;
mod dispatcher;
mod error;
mod extension;
mod message;
mod publication;
mod subscription;
pub mod transport;

pub use channel::Channel;
pub use client::{Client, ClientStatistics};
pub use config::ClientConfig;
pub use dispatcher::SessionState;
pub use error::{BayeuxError, BayeuxErrorResponse, Result};
pub use extension::{CustomExtension, DefaultExtension, FayeExtension};
pub use message::{Advice, ConnectionType, ReconnectAdvice};
pub use publication::Publication;
pub use subscription::{Subscription, SubscriptionCallback};
