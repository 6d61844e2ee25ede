//! # Response Streaming
//!
//! Drives the completion capability for one turn and hands the reply to a
//! caller-supplied sink one sentence unit at a time, while the model is still
//! generating.
//!
//! ## History Rules:
//! - The user utterance and the assistant reply are appended together once the
//!   reply is known, as two whole turns (never per-sentence fragments)
//! - A reply that fails before any unit was delivered leaves no trace in history
//! - A reply that fails after units were delivered is recorded as far as it
//!   was delivered, so the next turn sees what the user actually heard
//!
//! The session lock is only taken for short synchronous sections, never across
//! an `.await`.

use crate::error::VoiceError;
use crate::providers::{CompletionRequest, TextCompletion};
use crate::voice::finalizer::TurnResult;
use crate::voice::segmenter::SentenceSegmenter;
use crate::voice::session::{SessionHandle, SessionState, Turn};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// One deliverable piece of the reply. `index` counts from 0 within a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceUnit {
    pub index: usize,
    pub text: String,
}

#[derive(Clone)]
pub struct ResponseStreamer {
    completion: Arc<dyn TextCompletion>,
    /// May contain `{lesson}`.
    system_prompt: String,
    min_chars: usize,
}

/// What has reached the sink so far.
#[derive(Debug, Default)]
struct Delivered {
    text: String,
    units: usize,
}

impl Delivered {
    fn send<F>(&mut self, handle: &SessionHandle, units: Vec<String>, sink: &mut F) -> Result<(), VoiceError>
    where
        F: FnMut(SentenceUnit),
    {
        for text in units {
            if handle.is_closed() {
                return Err(VoiceError::Cancelled);
            }
            self.text.push_str(&text);
            sink(SentenceUnit {
                index: self.units,
                text,
            });
            self.units += 1;
        }
        Ok(())
    }
}

impl ResponseStreamer {
    pub fn new(completion: Arc<dyn TextCompletion>, system_prompt: String, min_chars: usize) -> Self {
        Self {
            completion,
            system_prompt,
            min_chars,
        }
    }

    fn prompt_for(&self, lesson_context_id: &str) -> String {
        self.system_prompt.replace("{lesson}", lesson_context_id)
    }

    /// Generate and deliver the reply to `turn`. Returns the full reply text.
    pub async fn respond<F>(
        &self,
        handle: &SessionHandle,
        turn: &TurnResult,
        mut sink: F,
    ) -> Result<String, VoiceError>
    where
        F: FnMut(SentenceUnit),
    {
        let request = {
            let session = handle.lock();
            if session.state() == SessionState::Closed {
                return Err(VoiceError::Cancelled);
            }
            let mut history = session.history().to_vec();
            history.push(Turn::user(turn.transcript.as_str()));
            CompletionRequest::new(&self.prompt_for(session.lesson_context_id()), &history)
        };

        let mut fragments = self.completion.complete(request);
        let mut segmenter = SentenceSegmenter::new(self.min_chars);
        let mut delivered = Delivered::default();

        while let Some(fragment) = fragments.next().await {
            if handle.is_closed() {
                return Err(VoiceError::Cancelled);
            }
            match fragment {
                Ok(text) => {
                    let ready = segmenter.push(&text);
                    delivered.send(handle, ready, &mut sink)?;
                }
                Err(e) => {
                    warn!(session_id = %handle.id(), error = %e, delivered_units = delivered.units, "Completion stream failed");
                    let complete = segmenter.finish_complete();
                    delivered.send(handle, complete, &mut sink)?;
                    return Err(self.abandon(handle, turn, delivered, e.to_string()));
                }
            }
        }

        let rest = segmenter.finish();
        delivered.send(handle, rest, &mut sink)?;

        let reply = segmenter.text().trim().to_string();
        if reply.is_empty() {
            return Err(VoiceError::CompletionFailed {
                detail: "the model returned an empty reply".to_string(),
                partial: false,
            });
        }

        record_turn(handle, turn, &reply)?;
        debug!(session_id = %handle.id(), units = delivered.units, chars = reply.len(), "Reply streamed");
        Ok(reply)
    }

    /// Build the error for a reply that broke off, recording whatever was delivered.
    fn abandon(&self, handle: &SessionHandle, turn: &TurnResult, delivered: Delivered, detail: String) -> VoiceError {
        if delivered.units == 0 {
            return VoiceError::CompletionFailed {
                detail,
                partial: false,
            };
        }
        if let Err(e) = record_turn(handle, turn, delivered.text.trim()) {
            return e;
        }
        VoiceError::CompletionFailed {
            detail,
            partial: true,
        }
    }
}

fn record_turn(handle: &SessionHandle, turn: &TurnResult, reply: &str) -> Result<(), VoiceError> {
    let mut session = handle.lock();
    if session.state() == SessionState::Closed {
        return Err(VoiceError::Cancelled);
    }
    session.push_turn(Turn::user(turn.transcript.as_str()));
    session.push_turn(Turn::assistant(reply));
    Ok(())
}
