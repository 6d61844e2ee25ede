//! Scripted stand-ins for the external capabilities, used by the voice tests.

use crate::error::ProviderError;
use crate::providers::{CompletionRequest, SpeechToText, TextCompletion, TextStream, Transcript};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Returns a fixed transcript, or fails, and records every call.
#[derive(Debug, Default)]
pub struct ScriptedSpeechToText {
    text: String,
    confidence: Option<f32>,
    fail: bool,
    calls: Mutex<Vec<(Bytes, String)>>,
}

impl ScriptedSpeechToText {
    pub fn returning(text: &str) -> Self {
        Self {
            text: text.to_string(),
            confidence: Some(0.9),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Audio payloads and formats received, in call order.
    pub fn calls(&self) -> Vec<(Bytes, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechToText for ScriptedSpeechToText {
    async fn transcribe(&self, audio: Bytes, format: &str) -> Result<Transcript, ProviderError> {
        self.calls.lock().unwrap().push((audio, format.to_string()));
        if self.fail {
            return Err(ProviderError::Status {
                status: 502,
                body: "upstream unavailable".to_string(),
            });
        }
        Ok(Transcript {
            text: self.text.clone(),
            confidence: self.confidence,
        })
    }
}

/// One step of a scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Fail,
    /// Park the stream until the notify fires.
    Wait(Arc<Notify>),
}

/// Replays one scripted reply per `complete` call and records the requests.
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Vec<Step>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        }
    }

    /// A completion that streams `fragments` for every call.
    pub fn fragments(fragments: &[&'static str], turns: usize) -> Self {
        let reply: Vec<Step> = fragments.iter().map(|f| Step::Text(*f)).collect();
        Self::new(vec![reply; turns])
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl TextCompletion for ScriptedCompletion {
    fn complete(&self, request: CompletionRequest) -> TextStream {
        self.requests.lock().unwrap().push(request);
        let steps = self.replies.lock().unwrap().pop_front().unwrap_or_default();

        stream::iter(steps)
            .then(|step| async move {
                match step {
                    Step::Text(text) => Some(Ok(text.to_string())),
                    Step::Fail => Some(Err(ProviderError::Decode("stream broke".to_string()))),
                    Step::Wait(notify) => {
                        notify.notified().await;
                        None
                    }
                }
            })
            .filter_map(|item| async move { item })
            .boxed()
    }
}
