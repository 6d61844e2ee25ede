//! # External Capabilities
//!
//! The voice core never recognizes speech or generates text itself. It drives
//! two external capabilities through the narrow traits below:
//!
//! - **`SpeechToText`**: one finished utterance in, one transcript out
//! - **`TextCompletion`**: the conversation so far in, a lazy stream of reply
//!   fragments out (finite, not restartable, may fail part-way)
//!
//! `openai` holds the HTTP implementations for OpenAI-compatible servers.
//! Neither trait retries; retry policy belongs to the client.

pub mod openai;
pub mod wav;

#[cfg(test)]
pub mod fake;

use crate::error::ProviderError;
use crate::voice::session::{Role, Turn};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;

pub use openai::{OpenAiChatCompletion, OpenAiSpeechToText};

/// Result of a transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// 0.0 to 1.0 when the provider reports one.
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one complete utterance. Called at most once per turn.
    async fn transcribe(&self, audio: Bytes, format: &str) -> Result<Transcript, ProviderError>;
}

/// Reply fragments in generation order.
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Everything a completion call needs: the system prompt followed by the
/// conversation history, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    pub fn new(system_prompt: &str, history: &[Turn]) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt.to_string(),
            });
        }
        messages.extend(history.iter().map(|turn| ChatMessage {
            role: match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: turn.text.clone(),
        }));
        Self { messages }
    }
}

pub trait TextCompletion: Send + Sync {
    /// Start generating a reply. Nothing happens until the stream is polled.
    fn complete(&self, request: CompletionRequest) -> TextStream;
}
