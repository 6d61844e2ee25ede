//! # Voice Protocol Messages
//!
//! JSON messages exchanged over `/ws/voice`, tagged by a `type` field.
//!
//! ## Client → Server:
//! - `audio_data { audio, format }`: one base64-encoded audio fragment
//! - `audio_end {}`: the user stopped speaking
//! - `text_message { text }`: a typed turn
//! - `ping { timestamp }`: application-level keepalive
//!
//! Binary WebSocket frames are accepted as a shorthand for `audio_data` in the
//! server's default format.
//!
//! ## Server → Client:
//! - `session_created`, `transcription`, `speech_response` / `text_response`
//!   (one per sentence unit), `response_complete`, `error`, `pong`

use crate::error::VoiceError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "audio_data")]
    AudioData {
        /// Base64 payload.
        audio: String,
        #[serde(default)]
        format: Option<String>,
    },

    #[serde(rename = "audio_end")]
    AudioEnd {},

    #[serde(rename = "text_message")]
    TextMessage { text: String },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

impl Inbound {
    pub fn parse(raw: &str) -> Result<Self, VoiceError> {
        serde_json::from_str(raw).map_err(|e| VoiceError::MalformedMessage(e.to_string()))
    }

    /// Protocol name of the message, as used in error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::AudioData { .. } => "audio_data",
            Inbound::AudioEnd {} => "audio_end",
            Inbound::TextMessage { .. } => "text_message",
            Inbound::Ping { .. } => "ping",
        }
    }

    /// Decode the base64 payload of an `audio_data` message.
    pub fn decode_audio(audio: &str) -> Result<Vec<u8>, VoiceError> {
        BASE64
            .decode(audio.trim())
            .map_err(|e| VoiceError::MalformedMessage(format!("audio is not valid base64: {e}")))
    }
}

/// Whether the turn started as speech or as typed text; selects the response kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOrigin {
    Speech,
    Text,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "session_created")]
    SessionCreated { session_id: String },

    #[serde(rename = "transcription")]
    Transcription {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    /// One sentence unit of a reply to spoken input.
    #[serde(rename = "speech_response")]
    SpeechResponse {
        session_id: String,
        index: usize,
        text: String,
    },

    /// One sentence unit of a reply to typed input.
    #[serde(rename = "text_response")]
    TextResponse {
        session_id: String,
        index: usize,
        text: String,
    },

    #[serde(rename = "response_complete")]
    ResponseComplete { session_id: String, text: String },

    #[serde(rename = "error")]
    Error {
        session_id: String,
        code: String,
        message: String,
        retryable: bool,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Outbound {
    pub fn unit(origin: TurnOrigin, session_id: &str, index: usize, text: String) -> Self {
        let session_id = session_id.to_string();
        match origin {
            TurnOrigin::Speech => Outbound::SpeechResponse {
                session_id,
                index,
                text,
            },
            TurnOrigin::Text => Outbound::TextResponse {
                session_id,
                index,
                text,
            },
        }
    }

    pub fn error(session_id: &str, error: &VoiceError) -> Self {
        Outbound::Error {
            session_id: session_id.to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.retryable(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and numbers, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal","message":"unserializable message"}"#.to_string()
        })
    }
}
