//! # Turn Finalization
//!
//! Closes a capture window and produces the user's utterance for the turn.
//! The audio path calls speech-to-text exactly once; the text path skips it.

use crate::error::VoiceError;
use crate::providers::SpeechToText;
use crate::voice::buffer::CapturedAudio;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The finalized user utterance handed to the response streamer.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub transcript: String,
    pub confidence: Option<f32>,
}

#[derive(Clone)]
pub struct TurnFinalizer {
    stt: Arc<dyn SpeechToText>,
}

impl TurnFinalizer {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self { stt }
    }

    /// Transcribe one captured utterance.
    ///
    /// An empty capture short-circuits to `EmptyTranscript` without calling
    /// the provider. A blank transcript (silence) is reported the same way.
    pub async fn finalize(&self, audio: CapturedAudio) -> Result<TurnResult, VoiceError> {
        if audio.is_empty() {
            return Err(VoiceError::EmptyTranscript);
        }

        let started = Instant::now();
        let bytes = audio.data.len();
        let transcript = self
            .stt
            .transcribe(audio.data, &audio.format)
            .await
            .map_err(|e| {
                warn!(error = %e, bytes, format = %audio.format, "Speech-to-text failed");
                VoiceError::TranscriptionFailed(e.to_string())
            })?;

        let text = transcript.text.trim();
        if text.is_empty() {
            return Err(VoiceError::EmptyTranscript);
        }

        debug!(
            bytes,
            chunks = audio.chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn finalized"
        );

        Ok(TurnResult {
            transcript: text.to_string(),
            confidence: transcript.confidence,
        })
    }

    /// A typed message is already final.
    pub fn wrap_text(text: &str) -> TurnResult {
        TurnResult {
            transcript: text.trim().to_string(),
            confidence: None,
        }
    }
}
