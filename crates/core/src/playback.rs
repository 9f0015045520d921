//! Playback jitter buffer.
//!
//! Downlink audio arrives in network-paced bursts and is drained by the output
//! device at a fixed rate. The buffer is split into a [`PlaybackWriter`] owned
//! by the session controller and a [`PlaybackReader`] owned by the device
//! callback. The halves share a lock-free chunk queue and an epoch counter:
//! `flush` bumps the epoch and the reader drops everything tagged with an
//! older epoch before its next read. Neither side ever waits on the other.

use crate::audio_utils::AudioFormat;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Consumed audio kept before the read prefix is discarded.
pub const COMPACT_AFTER: Duration = Duration::from_secs(2);

/// Chunks a single pull may move or discard.
pub const MAX_CHUNKS_PER_PULL: usize = 64;

/// Signals emitted by the reader towards the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A pull found fewer samples than the device asked for.
    ///
    /// `received` is the total number of samples the reader had taken off
    /// the queue at that point, so the writer can tell whether newer audio
    /// was appended after the signal was raised.
    Starved { received: u64 },
}

/// Outcome of a single device pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pull {
    /// Samples copied from the buffer; the rest of the request is silence.
    pub filled: usize,
    pub underrun: bool,
}

struct Chunk {
    epoch: u64,
    samples: Vec<f32>,
}

struct Shared {
    epoch: AtomicU64,
}

/// Creates the two halves of a playback buffer and the receiver for its
/// starvation signals.
pub fn channel(
    format: AudioFormat,
) -> (
    PlaybackWriter,
    PlaybackReader,
    mpsc::UnboundedReceiver<PlaybackEvent>,
) {
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        epoch: AtomicU64::new(0),
    });

    let writer = PlaybackWriter {
        chunks: chunk_tx,
        shared: shared.clone(),
        appended: AtomicU64::new(0),
    };
    let reader = PlaybackReader {
        chunks: chunk_rx,
        shared,
        events: event_tx,
        epoch: 0,
        samples: Vec::new(),
        cursor: 0,
        compact_after: format.samples_for(COMPACT_AFTER).max(1),
        received: 0,
        signalled: None,
    };
    (writer, reader, event_rx)
}

/// Producer half, used from the network side.
pub struct PlaybackWriter {
    chunks: mpsc::UnboundedSender<Chunk>,
    shared: Arc<Shared>,
    appended: AtomicU64,
}

impl PlaybackWriter {
    /// Queues samples at the tail. Never blocks; empty input is a no-op.
    pub fn append(&self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        self.appended
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        // A closed queue means the device side is already gone; the session
        // is tearing down and the audio has nowhere to go.
        let _ = self.chunks.send(Chunk { epoch, samples });
    }

    /// Discards everything appended so far, including chunks still in flight.
    pub fn flush(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Total samples ever appended through this writer.
    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// True when audio was appended after the reader raised `event`.
    pub fn is_stale(&self, event: PlaybackEvent) -> bool {
        match event {
            PlaybackEvent::Starved { received } => self.appended() > received,
        }
    }
}

/// Consumer half, owned by the output device callback.
pub struct PlaybackReader {
    chunks: mpsc::UnboundedReceiver<Chunk>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    epoch: u64,
    samples: Vec<f32>,
    cursor: usize,
    compact_after: usize,
    received: u64,
    signalled: Option<u64>,
}

impl PlaybackReader {
    /// Unread samples, including chunks still queued.
    ///
    /// Drains the whole queue, so the work grows with the backlog; the
    /// device callback uses [`pull_into`](Self::pull_into) instead.
    pub fn available(&mut self) -> usize {
        self.sync(usize::MAX, usize::MAX);
        self.samples.len() - self.cursor
    }

    /// Fills `out` from the buffer, padding with silence on underrun.
    ///
    /// Does no blocking work; this is the device's real-time path. Only the
    /// chunks needed to fill `out` are moved off the queue, and never more
    /// than [`MAX_CHUNKS_PER_PULL`], so a deep backlog costs no more than a
    /// shallow one.
    pub fn pull_into(&mut self, out: &mut [f32]) -> Pull {
        self.sync(out.len(), MAX_CHUNKS_PER_PULL);

        let unread = self.samples.len() - self.cursor;
        let filled = unread.min(out.len());
        out[..filled].copy_from_slice(&self.samples[self.cursor..self.cursor + filled]);
        out[filled..].fill(0.0);
        self.cursor += filled;

        let underrun = filled < out.len();
        if underrun && self.signalled != Some(self.received) {
            // One signal per starvation episode: re-armed once new audio arrives.
            self.signalled = Some(self.received);
            let _ = self.events.send(PlaybackEvent::Starved {
                received: self.received,
            });
        }

        self.compact();
        Pull { filled, underrun }
    }

    /// Returns `n` samples (zero-padded on underrun) and the underrun flag.
    pub fn pull(&mut self, n: usize) -> (Vec<f32>, bool) {
        let mut out = vec![0.0; n];
        let pull = self.pull_into(&mut out);
        (out, pull.underrun)
    }

    /// Moves queued chunks into the read buffer until `wanted` samples are
    /// unread, touching at most `budget` chunks. Stale chunks are discarded
    /// as they come off the queue.
    fn sync(&mut self, wanted: usize, mut budget: usize) {
        let current = self.shared.epoch.load(Ordering::Acquire);
        if current != self.epoch {
            self.reset(current);
        }
        while self.samples.len() - self.cursor < wanted && budget > 0 {
            let Ok(chunk) = self.chunks.try_recv() else {
                break;
            };
            budget -= 1;
            self.received += chunk.samples.len() as u64;
            if chunk.epoch < self.epoch {
                continue;
            }
            if chunk.epoch > self.epoch {
                // A flush landed after the epoch check above.
                self.reset(chunk.epoch);
            }
            self.samples.extend_from_slice(&chunk.samples);
        }
    }

    fn reset(&mut self, epoch: u64) {
        self.samples.clear();
        self.cursor = 0;
        self.epoch = epoch;
    }

    fn compact(&mut self) {
        if self.cursor == self.samples.len() {
            self.samples.clear();
            self.cursor = 0;
        } else if self.cursor > self.compact_after {
            self.samples.drain(..self.cursor);
            self.cursor = 0;
        }
        debug_assert!(self.cursor <= self.samples.len());
    }

    #[cfg(test)]
    fn consumed_prefix(&self) -> usize {
        self.cursor
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.samples.len()
    }
}
