//! Capture encoder: turns microphone samples into uplink messages.
//!
//! The input device callback pushes raw samples into a lock-free ring buffer;
//! the encoder task drains it one fixed-size frame at a time, quantizes to
//! PCM16 and queues the base64 text on the transport uplink.

use crate::{
    audio_utils::AudioFormat, error::StreamError, protocol, transport::UplinkSender,
};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Split},
};
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

/// Frames of headroom between the device callback and the encoder.
pub const CAPTURE_BUFFER_FRAMES: usize = 8;

/// Creates the ring buffer connecting an input device to a [`CaptureEncoder`].
pub fn capture_ring(format: AudioFormat) -> (HeapProd<f32>, HeapCons<f32>) {
    HeapRb::<f32>::new((format.frame_size * CAPTURE_BUFFER_FRAMES).max(1)).split()
}

pub struct CaptureEncoder {
    samples: HeapCons<f32>,
    frame: Vec<f32>,
    poll_interval: Duration,
}

impl CaptureEncoder {
    pub fn new(samples: HeapCons<f32>, format: AudioFormat) -> Self {
        Self {
            samples,
            frame: vec![0.0; format.frame_size],
            poll_interval: (format.frame_duration() / 4).max(Duration::from_millis(1)),
        }
    }

    /// Encodes the next complete frame, if one is buffered.
    pub fn next_message(&mut self) -> Option<String> {
        if self.frame.is_empty() || self.samples.occupied_len() < self.frame.len() {
            return None;
        }
        let read = self.samples.pop_slice(&mut self.frame);
        debug_assert_eq!(read, self.frame.len());
        Some(protocol::encode_uplink(&self.frame))
    }

    pub fn spawn(self, uplink: UplinkSender) -> JoinHandle<()> {
        let span = tracing::info_span!("capture_encoder");
        tokio::spawn(self.run(uplink).instrument(span))
    }

    /// Forwards frames until the uplink stops accepting them.
    pub async fn run(mut self, uplink: UplinkSender) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent: u64 = 0;
        let mut dropped: u64 = 0;

        loop {
            ticker.tick().await;
            while let Some(message) = self.next_message() {
                match uplink.send(message) {
                    Ok(()) => sent += 1,
                    Err(StreamError::NotOpen) => {
                        info!(sent, dropped, "Uplink closed; capture encoder stopping.");
                        return;
                    }
                    Err(e) => {
                        dropped += 1;
                        warn!(error = %e, dropped, "Dropped capture frame.");
                    }
                }
            }
            debug!(sent, "Capture encoder idle.");
        }
    }
}
