//! Defines the message protocol spoken over the duplex connection.
//!
//! Uplink messages are bare base64 PCM16 frames. Downlink messages are JSON
//! objects discriminated by an `event` field.

use crate::{audio_utils, error::StreamError};
use serde::{Deserialize, Serialize};

/// A single downlink message from the remote voice model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Envelope {
    /// Synthesized speech, base64-encoded little-endian PCM16.
    Media { data: String },
    /// Interrupt: drop any audio that has not been played yet.
    Stop,
    /// A transcript line, tagged with who said it.
    Text { speaker: String, content: String },
}

impl Envelope {
    /// Builds a media envelope from f32 samples.
    pub fn media(samples: &[f32]) -> Self {
        Envelope::Media {
            data: audio_utils::encode_f32_to_base64_i16(samples),
        }
    }

    pub fn text(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope::Text {
            speaker: speaker.into(),
            content: content.into(),
        }
    }

    /// Parses a downlink text message.
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text).map_err(|e| StreamError::Protocol(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Serializing a tagged enum of plain strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Media { .. } => "media",
            Envelope::Stop => "stop",
            Envelope::Text { .. } => "text",
        }
    }
}

/// Encodes one capture frame as an uplink message.
pub fn encode_uplink(frame: &[f32]) -> String {
    audio_utils::encode_f32_to_base64_i16(frame)
}
