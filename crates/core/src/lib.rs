//! Voicelink Core
//!
//! The real-time audio streaming engine: microphone frames are encoded to
//! PCM16 and streamed to a remote voice model over a single authenticated
//! WebSocket, while the model's speech is jitter-buffered and played back
//! with support for mid-utterance interruption.
//!
//! - `audio_utils`: PCM16 quantization and the base64 transport encoding.
//! - `playback`: the lock-free playback jitter buffer.
//! - `capture`: the capture encoder feeding the uplink.
//! - `protocol`: the downlink envelope format.
//! - `transport`: the duplex WebSocket session.
//! - `controller`: the session controller tying everything together.
//! - `device`: traits implemented by platform audio backends.

pub mod audio_utils;
pub mod capture;
pub mod controller;
pub mod device;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod transport;

pub use audio_utils::AudioFormat;
pub use controller::{
    SessionCommand, SessionConfig, SessionController, SessionHandle, SessionState, SessionView,
    TranscriptEntry,
};
pub use error::{FormatError, StreamError};
pub use protocol::Envelope;
