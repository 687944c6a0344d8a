//! A minimal terminal chat client over a Bayeux channel.
//!
//! ```text
//! faye-chat wss://example.com/bayeux /chat/demo alice
//! ```

use std::io::Write as _;
use std::sync::Arc;

use faye::transport::WsTransport;
use faye::{Client, ClientConfig};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

#[tokio::main]
async fn main() -> faye::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let endpoint = args.next().unwrap_or_else(|| "ws://localhost:8000/bayeux".to_owned());
    let channel = args.next().unwrap_or_else(|| "/chat/demo".to_owned());
    let username = args.next().unwrap_or_else(|| "anonymous".to_owned());

    let url = Url::parse(&endpoint).map_err(|e| faye::BayeuxError::protocol(e.to_string()))?;
    let config = ClientConfig::new(endpoint.clone());
    let transport = Arc::new(WsTransport::new(
        url,
        config.max_reconnect_attempts,
        config.reconnect_delay,
        config.heartbeat_interval,
    ));
    let client = Client::new(transport, config);

    client.connect().await?;
    println!("connected as {username}, client id {:?}", client.client_id());

    let username_for_callback = username.clone();
    client
        .subscribe(
            &channel,
            Box::new(move |data| {
                let text = data.get("text").and_then(|v| v.as_str()).unwrap_or("");
                let from = data.get("from").and_then(|v| v.as_str()).unwrap_or("?");
                if from != username_for_callback {
                    println!("{from}: {text}");
                }
            }),
        )
        .await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    print!("> ");
    std::io::stdout().flush().ok();
    while let Some(line) = lines.next_line().await.map_err(|e| faye::BayeuxError::network(e.to_string()))? {
        if line.is_empty() {
            continue;
        }
        client.publish(&channel, json!({"from": username, "text": line})).await?;
        print!("> ");
        std::io::stdout().flush().ok();
    }

    client.disconnect().await
}
