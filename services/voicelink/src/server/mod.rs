//! Loopback Peer Server
//!
//! A stand-in for the remote voice model, speaking the same wire protocol:
//! clients authenticate by offering the shared secret as the WebSocket
//! sub-protocol, uplink frames are echoed back as `media` envelopes, and loud
//! uplink frames interrupt playback with a `stop` first. It performs no
//! inference; it exists so the client can be exercised end to end.
//!
//! - `session`: the per-connection loop and the echo rules.

pub mod session;

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header::SEC_WEBSOCKET_PROTOCOL},
    response::{IntoResponse, Response},
    routing::get,
};
use secrecy::{ExposeSecret, SecretString};
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};
use voicelink_core::AudioFormat;

/// Uplink RMS above which the peer treats the frame as the user talking over it.
pub const DEFAULT_BARGE_IN_RMS: f32 = 0.1;

/// The shared state for every peer connection.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub shared_secret: SecretString,
    pub format: AudioFormat,
    pub barge_in_rms: f32,
}

impl PeerState {
    pub fn new(shared_secret: SecretString, format: AudioFormat) -> Self {
        Self {
            shared_secret,
            format,
            barge_in_rms: DEFAULT_BARGE_IN_RMS,
        }
    }

    /// True if any of the offered sub-protocols is the shared secret.
    fn accepts(&self, offered: Option<&str>) -> bool {
        let secret = self.shared_secret.expose_secret();
        offered.is_some_and(|list| list.split(',').any(|token| token.trim() == secret))
    }
}

/// Creates the Axum router for the loopback peer.
pub fn create_router(state: Arc<PeerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<PeerState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Loopback peer listening.");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "ok"
}

/// Upgrades the connection if the offered sub-protocol carries the secret.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<PeerState>>,
) -> Response {
    let offered = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    if !state.accepts(offered) {
        warn!("Rejected connection with an invalid shared secret.");
        return (StatusCode::UNAUTHORIZED, "invalid shared secret").into_response();
    }

    // Echo the token back so the client's handshake check passes.
    let protocol = state.shared_secret.expose_secret().to_string();
    ws.protocols([protocol])
        .on_upgrade(move |socket| session::handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_only_the_shared_secret() {
        let state = PeerState::new(SecretString::from("s3cret"), AudioFormat::default());
        assert!(state.accepts(Some("s3cret")));
        assert!(state.accepts(Some("chat, s3cret")));
        assert!(!state.accepts(Some("S3CRET")));
        assert!(!state.accepts(Some("s3cret-and-more")));
        assert!(!state.accepts(Some("")));
        assert!(!state.accepts(None));
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(health().await, "ok");
    }
}
