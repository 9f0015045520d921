#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use ringbuf::HeapProd;
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, StatusCode},
        protocol::Message,
    },
};
use voicelink_core::{
    AudioFormat, Envelope, StreamError,
    device::{ActiveStream, AudioDevices},
    playback::PlaybackReader,
};

pub const SECRET: &str = "test-shared-secret";
pub const WAIT: Duration = Duration::from_secs(5);

/// A WebSocket peer that checks the sub-protocol token, records every uplink
/// text frame and sends whatever the test queues on the downlink.
///
/// Connections are served one at a time; queued downlink messages go to
/// whichever connection is current.
pub struct ScriptedPeer {
    pub addr: SocketAddr,
    downlink: mpsc::UnboundedSender<Message>,
    pub uplink: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
}

impl ScriptedPeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (downlink, mut downlink_rx) = mpsc::unbounded_channel::<Message>();
        let (uplink_tx, uplink) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let Ok(ws) = accept_hdr_async(stream, check_token).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        outgoing = downlink_rx.recv() => match outgoing {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => return,
                        },
                        incoming = source.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                let _ = uplink_tx.send(text.to_string());
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
        });

        Self {
            addr,
            downlink,
            uplink,
            connections,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn send(&self, envelope: &Envelope) {
        self.send_raw(&envelope.to_json());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.downlink.send(Message::Text(text.to_string().into()));
    }

    pub fn close_connection(&self) {
        let _ = self.downlink.send(Message::Close(None));
    }

    /// Waits for the next uplink text frame.
    pub async fn next_uplink(&mut self) -> String {
        tokio::time::timeout(WAIT, self.uplink.recv())
            .await
            .expect("timed out waiting for an uplink frame")
            .expect("peer stopped")
    }
}

fn check_token(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|value| value.to_str().ok());
    if offered == Some(SECRET) {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SECRET));
        Ok(response)
    } else {
        let mut rejection = ErrorResponse::new(Some("invalid shared secret".to_string()));
        *rejection.status_mut() = StatusCode::UNAUTHORIZED;
        Err(rejection)
    }
}

/// A listener that accepts TCP connections and never answers the handshake.
pub async fn silent_listener() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

/// Audio devices with no hardware behind them: the test plays the part of
/// the device callbacks through the shared slots.
#[derive(Clone, Default)]
pub struct MockDevices {
    pub output: Arc<Mutex<Option<PlaybackReader>>>,
    pub input: Arc<Mutex<Option<HeapProd<f32>>>>,
}

impl MockDevices {
    pub fn output_open(&self) -> bool {
        self.output.lock().unwrap().is_some()
    }

    pub fn with_reader<R>(&self, f: impl FnOnce(&mut PlaybackReader) -> R) -> R {
        let mut slot = self.output.lock().unwrap();
        f(slot.as_mut().expect("output stream is not open"))
    }

    pub fn with_microphone<R>(&self, f: impl FnOnce(&mut HeapProd<f32>) -> R) -> R {
        let mut slot = self.input.lock().unwrap();
        f(slot.as_mut().expect("input stream is not open"))
    }
}

struct SlotStream<T: Send> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send> ActiveStream for SlotStream<T> {
    fn stop(&mut self) {
        self.slot.lock().unwrap().take();
    }
}

impl AudioDevices for MockDevices {
    fn open_input(
        &self,
        _format: AudioFormat,
        frames: HeapProd<f32>,
    ) -> Result<Box<dyn ActiveStream>, StreamError> {
        *self.input.lock().unwrap() = Some(frames);
        Ok(Box::new(SlotStream {
            slot: self.input.clone(),
        }))
    }

    fn open_output(
        &self,
        _format: AudioFormat,
        reader: PlaybackReader,
    ) -> Result<Box<dyn ActiveStream>, StreamError> {
        *self.output.lock().unwrap() = Some(reader);
        Ok(Box::new(SlotStream {
            slot: self.output.clone(),
        }))
    }
}
