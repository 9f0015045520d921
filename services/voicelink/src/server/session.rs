//! Manages one loopback peer connection.

use super::PeerState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use voicelink_core::{Envelope, FormatError, audio_utils};

pub const GREETING: &str =
    "Connected to the voicelink loopback peer. Speak and you will hear yourself.";

const CHIME_HZ: f32 = 880.0;
const CHIME_LENGTH: Duration = Duration::from_millis(300);
const CHIME_AMPLITUDE: f32 = 0.3;

/// The greeting sent as soon as a client connects: a short chime, then a line of text.
pub fn greeting(state: &PeerState) -> Vec<Envelope> {
    let chime = audio_utils::sine_tone(
        CHIME_HZ,
        CHIME_LENGTH,
        state.format.sample_rate,
        CHIME_AMPLITUDE,
    );
    vec![Envelope::media(&chime), Envelope::text("assistant", GREETING)]
}

/// Computes the replies to one uplink frame.
///
/// The frame is echoed back as media. A frame loud enough to count as the
/// user talking over playback is preceded by a `stop`.
pub fn respond(uplink: &str, barge_in_rms: f32) -> Result<Vec<Envelope>, FormatError> {
    let samples = audio_utils::decode_f32_from_base64_i16(uplink.trim())?;
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let mut replies = Vec::with_capacity(2);
    if audio_utils::rms(&samples) > barge_in_rms {
        replies.push(Envelope::Stop);
    }
    replies.push(Envelope::media(&samples));
    Ok(replies)
}

#[instrument(name = "peer_session", skip_all, fields(session_id = %Uuid::new_v4()))]
pub(super) async fn handle_socket(socket: WebSocket, state: Arc<PeerState>) {
    info!("Client connected.");
    let (mut sink, mut stream) = socket.split();

    for envelope in greeting(&state) {
        if send(&mut sink, &envelope).await.is_err() {
            warn!("Client went away during the greeting.");
            return;
        }
    }

    let mut frames: u64 = 0;
    let mut interruptions: u64 = 0;
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket receive failed.");
                break;
            }
        };

        let replies = match respond(text.as_str(), state.barge_in_rms) {
            Ok(replies) => replies,
            Err(e) => {
                warn!(error = %e, "Dropping malformed uplink frame.");
                continue;
            }
        };
        frames += 1;
        for envelope in replies {
            if envelope == Envelope::Stop {
                interruptions += 1;
                debug!("Barge-in detected; interrupting playback.");
            }
            if send(&mut sink, &envelope).await.is_err() {
                info!(frames, interruptions, "Client went away.");
                return;
            }
        }
    }
    info!(frames, interruptions, "Client disconnected.");
}

async fn send(
    sink: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(envelope.to_json().into())).await
}
