//! Audio capture and playback using CPAL.
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream lives on a
//! dedicated thread that builds it, starts it and holds it until stopped.

use cpal::{
    BufferSize, SampleRate, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{HeapProd, traits::Producer};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc as std_mpsc,
    },
    thread,
};
use tracing::{info, warn};
use voicelink_core::{
    AudioFormat, StreamError,
    device::{ActiveStream, AudioDevices},
    playback::PlaybackReader,
};

/// The host's default input and output devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn stream_config(format: AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    }
}

impl AudioDevices for CpalDevices {
    fn open_input(
        &self,
        format: AudioFormat,
        mut frames: HeapProd<f32>,
    ) -> Result<Box<dyn ActiveStream>, StreamError> {
        let dropped = Arc::new(AtomicU64::new(0));
        let overflow = dropped.clone();

        let mut stream = spawn_stream("voicelink-capture", StreamError::CaptureUnavailable, move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| "no input device available".to_string())?;
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                sample_rate = format.sample_rate,
                "Opening input device."
            );
            device
                .build_input_stream(
                    &stream_config(format),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let pushed = frames.push_slice(data);
                        if pushed < data.len() {
                            overflow.fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
                        }
                    },
                    |err| warn!(error = %err, "Input stream error."),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        stream.dropped = Some(dropped);
        Ok(Box::new(stream))
    }

    fn open_output(
        &self,
        format: AudioFormat,
        mut reader: PlaybackReader,
    ) -> Result<Box<dyn ActiveStream>, StreamError> {
        let stream = spawn_stream("voicelink-playback", StreamError::OutputUnavailable, move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| "no output device available".to_string())?;
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                sample_rate = format.sample_rate,
                "Opening output device."
            );
            device
                .build_output_stream(
                    &stream_config(format),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        reader.pull_into(data);
                    },
                    |err| warn!(error = %err, "Output stream error."),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        Ok(Box::new(stream))
    }
}

/// Runs `build` on a new thread and keeps the resulting stream playing there
/// until the returned handle is stopped.
fn spawn_stream<F>(
    name: &str,
    unavailable: fn(String) -> StreamError,
    build: F,
) -> Result<DeviceStream, StreamError>
where
    F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Blocks until the handle sends or is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| unavailable(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(DeviceStream {
            name: name.to_string(),
            stop: Some(stop_tx),
            thread: Some(thread),
            dropped: None,
        }),
        Ok(Err(reason)) => {
            let _ = thread.join();
            Err(unavailable(reason))
        }
        Err(_) => {
            let _ = thread.join();
            Err(unavailable("audio thread exited before the stream started".to_string()))
        }
    }
}

struct DeviceStream {
    name: String,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    /// Samples the capture callback could not buffer.
    dropped: Option<Arc<AtomicU64>>,
}

impl ActiveStream for DeviceStream {
    fn stop(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        drop(stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(stream = %self.name, "Audio thread panicked.");
            }
        }
        match self.dropped.as_ref().map(|d| d.load(Ordering::Relaxed)) {
            Some(dropped) if dropped > 0 => {
                warn!(stream = %self.name, dropped, "Capture overflowed; samples were dropped.");
            }
            _ => info!(stream = %self.name, "Audio stream stopped."),
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        ActiveStream::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_is_mono_at_session_rate() {
        let config = stream_config(AudioFormat::new(24_000, 512));
        assert_eq!(config.channels, 1);
        assert_eq!(config.sample_rate, SampleRate(24_000));
        assert_eq!(config.buffer_size, BufferSize::Default);
    }
}
