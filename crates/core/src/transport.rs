//! Duplex WebSocket transport to the remote voice model.
//!
//! The connection is authenticated by presenting the shared secret as the
//! WebSocket sub-protocol during the handshake. Once open, the socket is
//! split: outbound text goes through a bounded queue drained by a writer
//! task (so sending never waits on the network), and inbound messages are
//! parsed into [`Envelope`]s strictly in arrival order.

use crate::{error::StreamError, protocol::Envelope};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        error::ProtocolError,
        http::{HeaderValue, StatusCode},
        protocol::Message,
    },
};
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Uplink messages buffered before `send` starts reporting backpressure.
pub const UPLINK_QUEUE: usize = 128;

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One streaming connection to the remote peer.
pub struct DuplexTransport {
    endpoint: String,
    secret: SecretString,
    state: Arc<watch::Sender<TransportState>>,
    outbound: Option<mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl DuplexTransport {
    pub fn new(endpoint: impl Into<String>, secret: SecretString) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            secret,
            state: Arc::new(state),
            outbound: None,
            writer: None,
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Opens the connection, waiting at most `timeout` for the handshake.
    ///
    /// Returns the inbound half. Fails with [`StreamError::AuthRejected`] if
    /// the peer refuses the shared secret and [`StreamError::Connect`] for
    /// anything else, including the timeout.
    #[instrument(name = "transport_connect", skip_all, fields(endpoint = %self.endpoint))]
    pub async fn connect(&mut self, timeout: Duration) -> Result<EnvelopeStream, StreamError> {
        match self.state() {
            TransportState::Disconnected | TransportState::Closed => {}
            other => {
                return Err(StreamError::Connect(format!(
                    "transport is already {other:?}"
                )));
            }
        }
        self.state.send_replace(TransportState::Connecting);

        let ws = match self.handshake(timeout).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                self.state.send_replace(TransportState::Disconnected);
                return Err(e);
            }
        };

        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(UPLINK_QUEUE);
        self.writer = Some(tokio::spawn(write_loop(sink, outbound_rx)));
        self.outbound = Some(outbound_tx);
        self.state.send_replace(TransportState::Open);
        info!("Connected to remote peer.");

        Ok(EnvelopeStream {
            stream,
            state: self.state.clone(),
            finished: false,
        })
    }

    async fn handshake(&self, timeout: Duration) -> Result<WsStream, StreamError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        let protocol: HeaderValue = self.secret.expose_secret().parse().map_err(|_| {
            StreamError::Connect("shared secret is not a valid header value".to_string())
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        match tokio::time::timeout(timeout, connect_async(request)).await {
            Err(_) => Err(StreamError::Connect(format!(
                "handshake timed out after {} ms",
                timeout.as_millis()
            ))),
            Ok(Err(e)) => Err(classify_connect_error(e)),
            Ok(Ok((ws, _response))) => Ok(ws),
        }
    }

    /// Queues a text message for the peer. Only valid while `Open`.
    pub fn send(&self, text: String) -> Result<(), StreamError> {
        self.uplink().send(text)
    }

    /// A cloneable sending handle, used by the capture encoder.
    pub fn uplink(&self) -> UplinkSender {
        UplinkSender {
            outbound: self.outbound.clone(),
            state: self.state.clone(),
        }
    }

    /// Starts a graceful close. Idempotent; does not wait for queued sends.
    pub fn close(&mut self) {
        match self.state() {
            TransportState::Closing | TransportState::Closed => return,
            TransportState::Open => {
                self.state.send_replace(TransportState::Closing);
                if let Some(outbound) = self.outbound.take() {
                    // If the queue is full the writer still closes the sink
                    // once every sender is gone.
                    let _ = outbound.try_send(Message::Close(None));
                }
            }
            TransportState::Disconnected | TransportState::Connecting => {
                self.outbound = None;
            }
        }
        // The writer finishes in the background.
        drop(self.writer.take());
        self.state.send_replace(TransportState::Closed);
        debug!("Transport closed.");
    }
}

fn classify_connect_error(err: tungstenite::Error) -> StreamError {
    match &err {
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            StreamError::AuthRejected
        }
        // The peer accepted the upgrade but did not agree to our token.
        tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(_)) => {
            StreamError::AuthRejected
        }
        _ => StreamError::Connect(err.to_string()),
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "Uplink send failed; stopping writer.");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Cloneable handle for queuing uplink messages.
#[derive(Clone)]
pub struct UplinkSender {
    outbound: Option<mpsc::Sender<Message>>,
    state: Arc<watch::Sender<TransportState>>,
}

impl UplinkSender {
    /// Queues `text` without waiting. Returns [`StreamError::NotOpen`] once
    /// the transport has left `Open`, and [`StreamError::Transport`] when
    /// the queue is full and the message was dropped.
    pub fn send(&self, text: String) -> Result<(), StreamError> {
        if *self.state.borrow() != TransportState::Open {
            return Err(StreamError::NotOpen);
        }
        let Some(outbound) = &self.outbound else {
            return Err(StreamError::NotOpen);
        };
        outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    StreamError::Transport("uplink queue is full; message dropped".to_string())
                }
                TrySendError::Closed(_) => StreamError::NotOpen,
            })
    }
}

/// Inbound half of an open connection.
pub struct EnvelopeStream {
    stream: SplitStream<WsStream>,
    state: Arc<watch::Sender<TransportState>>,
    finished: bool,
}

impl std::fmt::Debug for EnvelopeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeStream")
            .field("state", &*self.state.borrow())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EnvelopeStream {
    /// Waits for the next inbound message.
    ///
    /// Malformed messages yield `Some(Err(StreamError::Protocol))` and the
    /// stream continues. A transport failure yields one
    /// `Some(Err(StreamError::Transport))`; afterwards, and after a close,
    /// this returns `None`.
    pub async fn recv(&mut self) -> Option<Result<Envelope, StreamError>> {
        if self.finished {
            return None;
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Envelope::parse(text.as_str())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(Err(StreamError::Protocol(format!(
                        "unexpected binary message ({} bytes)",
                        bytes.len()
                    ))));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer closed the connection.");
                    self.finish(TransportState::Closed);
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.finish(TransportState::Disconnected);
                    return Some(Err(StreamError::Transport(e.to_string())));
                }
                None => {
                    self.finish(TransportState::Closed);
                    return None;
                }
            }
        }
    }

    /// Calls `handler` once per inbound message, in arrival order, until the
    /// connection ends.
    pub async fn on_envelope<F>(mut self, mut handler: F)
    where
        F: FnMut(Result<Envelope, StreamError>),
    {
        while let Some(item) = self.recv().await {
            handler(item);
        }
    }

    fn finish(&mut self, end: TransportState) {
        self.finished = true;
        self.state.send_modify(|state| {
            // A locally initiated close always settles on `Closed`.
            *state = match *state {
                TransportState::Closing | TransportState::Closed => TransportState::Closed,
                _ => end,
            };
        });
    }
}
