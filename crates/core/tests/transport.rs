mod common;

use common::{SECRET, ScriptedPeer, WAIT};
use secrecy::SecretString;
use std::time::Duration;
use voicelink_core::{
    Envelope, StreamError,
    transport::{DuplexTransport, TransportState},
};

#[tokio::test]
async fn test_connect_send_and_close() {
    let mut peer = ScriptedPeer::start().await;
    let mut transport = DuplexTransport::new(peer.endpoint(), SecretString::from(SECRET));
    assert_eq!(transport.state(), TransportState::Disconnected);

    let envelopes = transport.connect(WAIT).await.unwrap();
    assert_eq!(transport.state(), TransportState::Open);
    let debug = format!("{envelopes:?}");
    assert!(debug.contains("Open"), "{debug}");
    assert!(!debug.contains(SECRET));

    transport.send("first".to_string()).unwrap();
    transport.send("second".to_string()).unwrap();
    assert_eq!(peer.next_uplink().await, "first");
    assert_eq!(peer.next_uplink().await, "second");

    transport.close();
    assert_eq!(transport.state(), TransportState::Closed);
    transport.close();
    assert_eq!(transport.state(), TransportState::Closed);

    assert!(matches!(
        transport.send("late".to_string()),
        Err(StreamError::NotOpen)
    ));
}

#[tokio::test]
async fn test_send_before_connect_is_not_open() {
    let transport = DuplexTransport::new("ws://127.0.0.1:9/ws", SecretString::from(SECRET));
    assert!(matches!(
        transport.send("hello".to_string()),
        Err(StreamError::NotOpen)
    ));
}

#[tokio::test]
async fn test_wrong_secret_is_auth_rejected() {
    let peer = ScriptedPeer::start().await;
    let mut transport = DuplexTransport::new(peer.endpoint(), SecretString::from("wrong"));

    let err = transport.connect(WAIT).await.unwrap_err();
    assert!(matches!(err, StreamError::AuthRejected));
    assert_eq!(transport.state(), TransportState::Disconnected);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let (addr, _listener) = common::silent_listener().await;
    let mut transport = DuplexTransport::new(format!("ws://{addr}/ws"), SecretString::from(SECRET));

    let started = tokio::time::Instant::now();
    let err = transport
        .connect(Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Connect(_)));
    assert!(started.elapsed() < WAIT);
    assert_eq!(transport.state(), TransportState::Disconnected);
}

#[tokio::test]
async fn test_envelopes_arrive_in_order_and_malformed_ones_are_reported() {
    let peer = ScriptedPeer::start().await;
    let mut transport = DuplexTransport::new(peer.endpoint(), SecretString::from(SECRET));
    let envelopes = transport.connect(WAIT).await.unwrap();
    let mut state = transport.watch_state();

    peer.send(&Envelope::text("assistant", "one"));
    peer.send_raw("{not json");
    peer.send(&Envelope::Stop);
    peer.send(&Envelope::text("assistant", "two"));
    peer.close_connection();

    let mut received = Vec::new();
    tokio::time::timeout(
        WAIT,
        envelopes.on_envelope(|item| received.push(item.map_err(|e| e.to_string()))),
    )
    .await
    .expect("peer should close the stream");

    assert_eq!(received.len(), 4);
    assert_eq!(received[0], Ok(Envelope::text("assistant", "one")));
    assert!(received[1].as_ref().unwrap_err().starts_with("protocol error"));
    assert_eq!(received[2], Ok(Envelope::Stop));
    assert_eq!(received[3], Ok(Envelope::text("assistant", "two")));

    state
        .wait_for(|s| *s == TransportState::Closed)
        .await
        .unwrap();
}
