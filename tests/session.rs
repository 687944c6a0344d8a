use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use faye::transport::MockTransport;
use faye::{Client, ClientConfig, ConnectionType, SessionState};
use serde_json::json;

fn respond_to_meta(transport: &MockTransport) {
    for envelope in transport.drain_sent() {
        let id = envelope["id"].as_str().unwrap().to_owned();
        let channel = envelope["channel"].as_str().unwrap_or_default();
        let response = match channel {
            "/meta/handshake" => {
                json!({"channel": "/meta/handshake", "successful": true, "clientId": "session-1", "id": id})
            }
            "/meta/connect" => {
                json!({"channel": "/meta/connect", "successful": true, "clientId": "session-1", "id": id})
            }
            "/meta/subscribe" => {
                json!({"channel": "/meta/subscribe", "successful": true, "clientId": "session-1", "subscription": envelope["subscription"], "id": id})
            }
            "/meta/unsubscribe" => {
                json!({"channel": "/meta/unsubscribe", "successful": true, "clientId": "session-1", "subscription": envelope["subscription"], "id": id})
            }
            "/meta/disconnect" => {
                json!({"channel": "/meta/disconnect", "successful": true, "clientId": "session-1", "id": id})
            }
            _ => json!({"channel": channel, "successful": true, "clientId": "session-1", "id": id}),
        };
        transport.push_response(response);
    }
}

async fn spawn_driver(transport: Arc<MockTransport>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            respond_to_meta(&transport);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

#[tokio::test]
async fn full_handshake_subscribe_publish_roundtrip() {
    let transport = Arc::new(MockTransport::new(ConnectionType::LongPolling));
    let client = Client::new(transport.clone(), ClientConfig::new("https://example.com/bayeux"));
    let driver = spawn_driver(transport.clone()).await;

    client.connect().await.unwrap();
    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(client.client_id().as_deref(), Some("session-1"));

    let received = Arc::new(AtomicUsize::new(0));
    let received2 = received.clone();
    client
        .subscribe(
            "/chat/lobby",
            Box::new(move |data| {
                if data["text"] == json!("hi") {
                    received2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .await
        .unwrap();

    let publication = client.publish("/chat/lobby", json!({"text": "hi"})).await.unwrap();
    assert!(publication.successful());

    transport.push_response(json!({"channel": "/chat/lobby", "data": {"text": "hi"}}));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);

    client.disconnect().await.unwrap();
    driver.abort();
    assert_eq!(client.state(), SessionState::Unconnected);
}

#[tokio::test]
async fn pattern_fan_out_across_multiple_subscriptions() {
    let transport = Arc::new(MockTransport::new(ConnectionType::LongPolling));
    let client = Client::new(transport.clone(), ClientConfig::new("https://example.com/bayeux"));
    let driver = spawn_driver(transport.clone()).await;

    client.connect().await.unwrap();

    let wildcard_hits = Arc::new(AtomicUsize::new(0));
    let exact_hits = Arc::new(AtomicUsize::new(0));
    let wildcard_hits2 = wildcard_hits.clone();
    let exact_hits2 = exact_hits.clone();

    client
        .subscribe("/chat/*", Box::new(move |_| { wildcard_hits2.fetch_add(1, Ordering::SeqCst); }))
        .await
        .unwrap();
    client
        .subscribe("/chat/lobby", Box::new(move |_| { exact_hits2.fetch_add(1, Ordering::SeqCst); }))
        .await
        .unwrap();

    transport.push_response(json!({"channel": "/chat/lobby", "data": {}}));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
    assert_eq!(exact_hits.load(Ordering::SeqCst), 1);

    driver.abort();
}

#[tokio::test]
async fn request_times_out_when_server_never_responds() {
    let transport = Arc::new(MockTransport::new(ConnectionType::LongPolling));
    let config = ClientConfig::new("https://example.com/bayeux").with_timeout(Duration::from_millis(20));
    let client = Client::new(transport, config);

    let result = tokio::time::timeout(Duration::from_millis(200), client.connect()).await;
    let connect_result = result.expect("connect() should itself time out, not hang forever");
    assert!(connect_result.is_err());
}

#[tokio::test]
async fn publish_after_transport_failure_is_a_failed_publication() {
    let transport = Arc::new(MockTransport::new(ConnectionType::LongPolling));
    let client = Client::new(transport.clone(), ClientConfig::new("https://example.com/bayeux"));
    let driver = spawn_driver(transport.clone()).await;
    client.connect().await.unwrap();
    driver.abort();

    transport.set_fail_sends(true);

    let publication = client.publish("/chat/lobby", json!({"text": "lost"})).await.unwrap();
    assert!(!publication.successful());
    assert!(publication.error().is_some());
}
