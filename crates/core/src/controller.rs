//! Session controller.
//!
//! Binds user intent (engage / disengage) to the lifetime of one streaming
//! session and routes downlink envelopes to the right sink: audio to the
//! playback buffer, interrupts to a flush, transcript lines to the log. The
//! UI collaborator only ever sees the read-only [`SessionView`].

use crate::{
    audio_utils::{self, AudioFormat},
    capture::{self, CaptureEncoder},
    device::{ActiveStream, AudioDevices},
    error::StreamError,
    playback::{self, PlaybackEvent, PlaybackWriter},
    protocol::Envelope,
    transport::{DuplexTransport, EnvelopeStream},
};
use ringbuf::HeapCons;
use secrecy::SecretString;
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub content: String,
}

/// Requests from the UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Engage,
    Disengage,
    Shutdown,
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub shared_secret: SecretString,
    pub format: AudioFormat,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, shared_secret: SecretString) -> Self {
        Self {
            endpoint: endpoint.into(),
            shared_secret,
            format: AudioFormat::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Read-only session signals for the UI.
#[derive(Clone)]
pub struct SessionView {
    pub talking: watch::Receiver<bool>,
    pub state: watch::Receiver<SessionState>,
    pub transcript: watch::Receiver<Vec<TranscriptEntry>>,
    /// The last fatal error surfaced to the user, cleared on a successful engage.
    pub last_error: watch::Receiver<Option<String>>,
}

struct Signals {
    talking: watch::Sender<bool>,
    state: watch::Sender<SessionState>,
    transcript: watch::Sender<Vec<TranscriptEntry>>,
    last_error: watch::Sender<Option<String>>,
}

struct ActiveSession {
    id: Uuid,
    playback: PlaybackWriter,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    output: Box<dyn ActiveStream>,
    input: Box<dyn ActiveStream>,
    encoder: JoinHandle<()>,
    transport: DuplexTransport,
    envelopes: EnvelopeStream,
}

type ConnectFuture =
    Pin<Box<dyn Future<Output = (DuplexTransport, Result<EnvelopeStream, StreamError>)> + Send>>;

/// Devices are open and the handshake is in flight.
struct PendingSession {
    id: Uuid,
    span: tracing::Span,
    playback: PlaybackWriter,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    output: Box<dyn ActiveStream>,
    input: Box<dyn ActiveStream>,
    samples: HeapCons<f32>,
    connect: ConnectFuture,
}

enum SessionEvent {
    Command(Option<SessionCommand>),
    Connected(DuplexTransport, Result<EnvelopeStream, StreamError>),
    Inbound(Result<Envelope, StreamError>),
    TransportEnded,
    Playback(PlaybackEvent),
}

pub struct SessionController {
    config: SessionConfig,
    devices: Arc<dyn AudioDevices>,
    signals: Signals,
    pending: Option<PendingSession>,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(config: SessionConfig, devices: Arc<dyn AudioDevices>) -> Self {
        let (talking, _) = watch::channel(false);
        let (state, _) = watch::channel(SessionState::Idle);
        let (transcript, _) = watch::channel(Vec::new());
        let (last_error, _) = watch::channel(None);
        Self {
            config,
            devices,
            signals: Signals {
                talking,
                state,
                transcript,
                last_error,
            },
            pending: None,
            active: None,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            talking: self.signals.talking.subscribe(),
            state: self.signals.state.subscribe(),
            transcript: self.signals.transcript.subscribe(),
            last_error: self.signals.last_error.subscribe(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.signals.state.borrow()
    }

    pub fn is_talking(&self) -> bool {
        *self.signals.talking.borrow()
    }

    /// Opens playback, starts capture and connects, in that order.
    ///
    /// Any failure releases whatever was already acquired, returns the
    /// controller to `Idle` and is surfaced through [`SessionView::last_error`].
    /// Engaging while not `Idle` is ignored.
    pub async fn engage(&mut self) -> Result<(), StreamError> {
        if !self.begin_engage()? {
            return Ok(());
        }
        let (transport, result) = next_connect(self.pending.as_mut()).await;
        match self.pending.take() {
            Some(pending) => self.complete_engage(pending, transport, result),
            None => Ok(()),
        }
    }

    /// Validates the format, opens both devices and arms the connect future.
    ///
    /// Returns `Ok(false)` when the engage was ignored.
    fn begin_engage(&mut self) -> Result<bool, StreamError> {
        if self.state() != SessionState::Idle {
            warn!(state = ?self.state(), "Engage ignored; session is not idle.");
            return Ok(false);
        }
        let format = self.config.format;
        if let Err(e) = format.validate() {
            return Err(self.fail_engage(e));
        }

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", session_id = %id);
        let _entered = span.clone().entered();
        self.set_state(SessionState::Connecting);

        let (playback, reader, playback_events) = playback::channel(format);
        let mut output = match self.devices.open_output(format, reader) {
            Ok(output) => output,
            Err(e) => return Err(self.fail_engage(e)),
        };

        let (producer, samples) = capture::capture_ring(format);
        let input = match self.devices.open_input(format, producer) {
            Ok(input) => input,
            Err(e) => {
                output.stop();
                return Err(self.fail_engage(e));
            }
        };

        let mut transport = DuplexTransport::new(
            self.config.endpoint.clone(),
            self.config.shared_secret.clone(),
        );
        let timeout = self.config.connect_timeout;
        let connect = async move {
            let result = transport.connect(timeout).await;
            (transport, result)
        }
        .instrument(span.clone());

        self.pending = Some(PendingSession {
            id,
            span,
            playback,
            playback_events,
            output,
            input,
            samples,
            connect: Box::pin(connect),
        });
        debug!(endpoint = %self.config.endpoint, "Devices open; connecting.");
        Ok(true)
    }

    fn complete_engage(
        &mut self,
        pending: PendingSession,
        transport: DuplexTransport,
        result: Result<EnvelopeStream, StreamError>,
    ) -> Result<(), StreamError> {
        let PendingSession {
            id,
            span,
            playback,
            playback_events,
            mut output,
            mut input,
            samples,
            connect: _,
        } = pending;
        let _entered = span.enter();

        let envelopes = match result {
            Ok(envelopes) => envelopes,
            Err(e) => {
                input.stop();
                output.stop();
                return Err(self.fail_engage(e));
            }
        };

        let format = self.config.format;
        let encoder = CaptureEncoder::new(samples, format).spawn(transport.uplink());
        self.active = Some(ActiveSession {
            id,
            playback,
            playback_events,
            output,
            input,
            encoder,
            transport,
            envelopes,
        });
        self.signals.last_error.send_replace(None);
        self.set_state(SessionState::Active);
        info!(
            sample_rate = format.sample_rate,
            frame_size = format.frame_size,
            "Session active."
        );
        Ok(())
    }

    fn fail_engage(&mut self, err: StreamError) -> StreamError {
        error!(error = %err, "Engage failed.");
        self.signals.last_error.send_replace(Some(err.to_string()));
        self.set_state(SessionState::Idle);
        err
    }

    /// Halts capture, discards buffered audio and closes the connection
    /// without waiting for queued sends. During `Connecting` the handshake
    /// is abandoned and both devices are released.
    pub fn disengage(&mut self) {
        self.release("disengaged");
    }

    fn release(&mut self, reason: &str) {
        if let Some(pending) = self.pending.take() {
            self.cancel_connect(pending, reason);
        }
        let Some(mut active) = self.active.take() else {
            return;
        };
        self.set_state(SessionState::Closing);

        active.input.stop();
        active.encoder.abort();
        active.playback.flush();
        active.output.stop();
        active.transport.close();
        let session_id = active.id;
        drop(active);

        self.set_talking(false);
        self.set_state(SessionState::Idle);
        info!(%session_id, reason, "Session released.");
    }

    fn cancel_connect(&mut self, mut pending: PendingSession, reason: &str) {
        let _entered = pending.span.clone().entered();
        self.set_state(SessionState::Closing);

        pending.input.stop();
        pending.playback.flush();
        pending.output.stop();
        let session_id = pending.id;
        // Dropping the future abandons the handshake and its socket.
        drop(pending);

        self.set_talking(false);
        self.set_state(SessionState::Idle);
        info!(%session_id, reason, "Connect cancelled.");
    }

    /// Drives the controller until `Shutdown` or until every command sender is gone.
    ///
    /// The handshake runs inside the loop, so commands stay live while connecting.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => SessionEvent::Command(command),
                (transport, result) = next_connect(self.pending.as_mut()) => {
                    SessionEvent::Connected(transport, result)
                }
                event = next_session_event(self.active.as_mut()) => event,
            };
            match event {
                SessionEvent::Command(Some(SessionCommand::Engage)) => {
                    // Failures are already logged and surfaced on the view.
                    let _ = self.begin_engage();
                }
                SessionEvent::Command(Some(SessionCommand::Disengage)) => self.disengage(),
                SessionEvent::Command(Some(SessionCommand::Shutdown)) | SessionEvent::Command(None) => {
                    self.release("shutdown");
                    break;
                }
                SessionEvent::Connected(transport, result) => {
                    if let Some(pending) = self.pending.take() {
                        let _ = self.complete_engage(pending, transport, result);
                    }
                }
                SessionEvent::Inbound(inbound) => self.handle_inbound(inbound),
                SessionEvent::TransportEnded => self.release("transport ended"),
                SessionEvent::Playback(event) => self.handle_playback_event(event),
            }
        }
        debug!("Session controller stopped.");
    }

    /// Spawns [`run`](Self::run) and returns a handle for sending commands.
    pub fn spawn(self) -> SessionHandle {
        let (commands, rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(rx));
        SessionHandle { commands, task }
    }

    fn handle_inbound(&mut self, inbound: Result<Envelope, StreamError>) {
        match inbound {
            Ok(Envelope::Media { data }) => self.handle_media(&data),
            Ok(Envelope::Stop) => {
                if let Some(active) = &self.active {
                    active.playback.flush();
                }
                self.set_talking(false);
                info!("Playback interrupted by peer.");
            }
            Ok(Envelope::Text { speaker, content }) => {
                debug!(%speaker, "Transcript line received.");
                self.signals
                    .transcript
                    .send_modify(|log| log.push(TranscriptEntry { speaker, content }));
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Transport failure.");
                self.signals.last_error.send_replace(Some(e.to_string()));
            }
            Err(e) => warn!(error = %e, "Dropping malformed message."),
        }
    }

    fn handle_media(&mut self, data: &str) {
        let samples = match audio_utils::decode_f32_from_base64_i16(data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %StreamError::from(e), "Dropping media envelope.");
                return;
            }
        };
        if samples.is_empty() {
            return;
        }
        if let Some(active) = &self.active {
            active.playback.append(samples);
            self.set_talking(true);
        }
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        let Some(active) = &self.active else {
            return;
        };
        // Audio appended after the reader starved means we are still talking.
        if !active.playback.is_stale(event) {
            self.set_talking(false);
        }
    }

    fn set_talking(&self, talking: bool) {
        let changed = self.signals.talking.send_if_modified(|current| {
            let changed = *current != talking;
            *current = talking;
            changed
        });
        if changed {
            debug!(talking, "Talking state changed.");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.signals.state.send_replace(state);
    }
}

async fn next_connect(
    pending: Option<&mut PendingSession>,
) -> (DuplexTransport, Result<EnvelopeStream, StreamError>) {
    let Some(pending) = pending else {
        return std::future::pending().await;
    };
    (&mut pending.connect).await
}

async fn next_session_event(active: Option<&mut ActiveSession>) -> SessionEvent {
    let Some(active) = active else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = active.playback_events.recv() => SessionEvent::Playback(event),
        inbound = active.envelopes.recv() => match inbound {
            Some(item) => SessionEvent::Inbound(item),
            None => SessionEvent::TransportEnded,
        },
    }
}

/// Command handle for a spawned [`SessionController`].
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Sends a command. Returns false if the controller has stopped.
    pub async fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn engage(&self) -> bool {
        self.send(SessionCommand::Engage).await
    }

    pub async fn disengage(&self) -> bool {
        self.send(SessionCommand::Disengage).await
    }

    /// Shuts the controller down and waits for it to release everything.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::PlaybackReader;
    use ringbuf::HeapProd;

    struct NullStream;

    impl ActiveStream for NullStream {
        fn stop(&mut self) {}
    }

    /// Devices that accept everything, or refuse the microphone.
    struct StubDevices {
        microphone: bool,
    }

    impl AudioDevices for StubDevices {
        fn open_input(
            &self,
            _format: AudioFormat,
            _frames: HeapProd<f32>,
        ) -> Result<Box<dyn ActiveStream>, StreamError> {
            if self.microphone {
                Ok(Box::new(NullStream))
            } else {
                Err(StreamError::CaptureUnavailable(
                    "no input device available".to_string(),
                ))
            }
        }

        fn open_output(
            &self,
            _format: AudioFormat,
            _reader: PlaybackReader,
        ) -> Result<Box<dyn ActiveStream>, StreamError> {
            Ok(Box::new(NullStream))
        }
    }

    fn controller(microphone: bool, endpoint: &str) -> SessionController {
        let mut config = SessionConfig::new(endpoint, SecretString::from("secret"));
        config.connect_timeout = Duration::from_millis(500);
        SessionController::new(
            config,
            Arc::new(StubDevices { microphone }),
        )
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("ws://localhost:8000/ws", SecretString::from("k"));
        assert_eq!(config.format, AudioFormat::default());
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        // The secret never leaks through Debug.
        assert!(!format!("{config:?}").contains("\"k\""));
    }

    #[tokio::test]
    async fn test_capture_unavailable_is_surfaced_and_idle() {
        let mut controller = controller(false, "ws://127.0.0.1:9/ws");
        let view = controller.view();

        let err = controller.engage().await.unwrap_err();
        assert!(matches!(err, StreamError::CaptureUnavailable(_)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(
            view.last_error
                .borrow()
                .as_deref()
                .unwrap()
                .contains("capture unavailable")
        );
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut controller = controller(true, &format!("ws://{addr}/ws"));
        let err = controller.engage().await.unwrap_err();
        assert!(matches!(err, StreamError::Connect(_)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!controller.is_talking());

        // A failed attempt leaves nothing behind; the user may simply retry.
        let err = controller.engage().await.unwrap_err();
        assert!(matches!(err, StreamError::Connect(_)));
    }

    #[tokio::test]
    async fn test_zero_frame_size_is_rejected_before_devices_open() {
        let mut controller = controller(false, "ws://127.0.0.1:9/ws");
        controller.config.format = AudioFormat::new(16_000, 0);
        let view = controller.view();

        // The stub would refuse the microphone; validation fails first.
        let err = controller.engage().await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidFormat(_)));
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.pending.is_none());
        assert!(
            view.last_error
                .borrow()
                .as_deref()
                .unwrap()
                .starts_with("invalid audio format")
        );
    }

    #[tokio::test]
    async fn test_disengage_while_connecting_drops_the_handshake() {
        // Accepts TCP but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut controller = controller(true, &format!("ws://{addr}/ws"));

        assert!(controller.begin_engage().unwrap());
        assert_eq!(controller.state(), SessionState::Connecting);
        assert!(controller.pending.is_some());

        controller.disengage();
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.pending.is_none());
        assert!(controller.active.is_none());
    }

    #[tokio::test]
    async fn test_disengage_when_idle_is_noop() {
        let mut controller = controller(true, "ws://127.0.0.1:9/ws");
        controller.disengage();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_envelopes_without_session_only_touch_ui_state() {
        let mut controller = controller(true, "ws://127.0.0.1:9/ws");
        let view = controller.view();

        controller.handle_inbound(Ok(Envelope::media(&[0.5; 16])));
        assert!(!controller.is_talking());

        controller.handle_inbound(Ok(Envelope::text("assistant", "hello")));
        controller.handle_inbound(Ok(Envelope::text("user", "hi")));
        assert_eq!(
            *view.transcript.borrow(),
            vec![
                TranscriptEntry {
                    speaker: "assistant".to_string(),
                    content: "hello".to_string()
                },
                TranscriptEntry {
                    speaker: "user".to_string(),
                    content: "hi".to_string()
                },
            ]
        );

        controller.handle_inbound(Err(StreamError::Protocol("bad".to_string())));
        assert!(view.last_error.borrow().is_none());
    }

    #[tokio::test]
    async fn test_handle_shutdown_without_engage() {
        let controller = controller(true, "ws://127.0.0.1:9/ws");
        let view = controller.view();
        let handle = controller.spawn();
        handle.shutdown().await;
        assert_eq!(*view.state.borrow(), SessionState::Idle);
    }
}
