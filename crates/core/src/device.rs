//! Seam between the engine and the platform's audio hardware.

use crate::{audio_utils::AudioFormat, error::StreamError, playback::PlaybackReader};
use ringbuf::HeapProd;

/// A running device stream. Stopping it releases whatever the stream was
/// given when it was opened (the capture producer or the playback reader).
pub trait ActiveStream: Send {
    fn stop(&mut self);
}

/// Opens fixed-rate mono audio streams at the session's [`AudioFormat`].
///
/// Implementations must not route captured samples to the output device:
/// local monitoring of the microphone stays muted.
pub trait AudioDevices: Send + Sync {
    /// Starts capturing into `frames`. Errors are reported as
    /// [`StreamError::CaptureUnavailable`].
    fn open_input(
        &self,
        format: AudioFormat,
        frames: HeapProd<f32>,
    ) -> Result<Box<dyn ActiveStream>, StreamError>;

    /// Starts playback, pulling one device quantum at a time from `reader`.
    fn open_output(
        &self,
        format: AudioFormat,
        reader: PlaybackReader,
    ) -> Result<Box<dyn ActiveStream>, StreamError>;
}
