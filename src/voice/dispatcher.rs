//! # Protocol Dispatcher
//!
//! The per-session state machine. Work is split in two halves so the socket
//! never waits on an external service:
//!
//! 1. **`accept`** (synchronous): validates the message against the current
//!    state, applies the cheap part (append audio, take the buffer, claim the
//!    session for a turn) under the session lock, and says what to do next
//! 2. **`run_turn`** (async): transcribes and/or streams the reply, emitting
//!    outbound messages in event order, then hands the session back to `Ready`
//!
//! ## Transitions:
//! - `Ready` + `audio_data` → `ReceivingAudio`
//! - `Ready` + `text_message` → `Streaming`
//! - `ReceivingAudio` + `audio_data` → `ReceivingAudio`
//! - `ReceivingAudio` + `audio_end` → `Finalizing` → `Streaming` → `Ready`
//! - `Ready` + `audio_end` → `empty_transcript` error, stays `Ready`
//! - anything else → `invalid_state` error, state unchanged
//!
//! Because `accept` moves the session into `Finalizing`/`Streaming` before it
//! returns, a second turn for the same session cannot start until `run_turn`
//! has finished the first.

use crate::error::VoiceError;
use crate::voice::buffer::CapturedAudio;
use crate::voice::finalizer::{TurnFinalizer, TurnResult};
use crate::voice::protocol::{Inbound, Outbound, TurnOrigin};
use crate::voice::session::{SessionHandle, SessionState, SessionStore, VoiceSession};
use crate::voice::streamer::ResponseStreamer;
use std::sync::Arc;
use tracing::{debug, info};

/// What `accept` decided. Only `Finalize` and `Respond` need `run_turn`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// The message was fully handled.
    Buffered,
    /// Send this straight back; no state involved.
    Reply(Outbound),
    Finalize(CapturedAudio),
    Respond { turn: TurnResult, origin: TurnOrigin },
}

impl Command {
    pub fn starts_turn(&self) -> bool {
        matches!(self, Command::Finalize(_) | Command::Respond { .. })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<SessionStore>,
    finalizer: TurnFinalizer,
    streamer: ResponseStreamer,
    default_format: String,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        finalizer: TurnFinalizer,
        streamer: ResponseStreamer,
        default_format: String,
    ) -> Self {
        Self {
            store,
            finalizer,
            streamer,
            default_format,
        }
    }

    /// Apply one inbound message to the session.
    pub fn accept(&self, session_id: &str, message: Inbound) -> Result<Command, VoiceError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock();
        if session.state() == SessionState::Closed {
            return Err(VoiceError::SessionNotFound(session_id.to_string()));
        }
        session.touch();

        let state = session.state();
        match (state, message) {
            (_, Inbound::Ping { timestamp }) => Ok(Command::Reply(Outbound::Pong { timestamp })),

            (SessionState::Ready | SessionState::ReceivingAudio, Inbound::AudioData { audio, format }) => {
                let bytes = Inbound::decode_audio(&audio)?;
                let format = format.unwrap_or_else(|| self.default_format.clone());
                self.append_audio(&mut session, &bytes, &format)
            }

            (SessionState::ReceivingAudio, Inbound::AudioEnd {}) => {
                let captured = session.pending_audio_mut().take();
                session.set_state(SessionState::Finalizing);
                debug!(session_id = %session_id, bytes = captured.data.len(), chunks = captured.chunks, "Audio capture closed");
                Ok(Command::Finalize(captured))
            }

            // Nothing was captured, so there is nothing to transcribe.
            (SessionState::Ready, Inbound::AudioEnd {}) => Err(VoiceError::EmptyTranscript),

            (SessionState::Ready, Inbound::TextMessage { text }) => {
                if text.trim().is_empty() {
                    return Err(VoiceError::MalformedMessage(
                        "text_message.text must not be empty".to_string(),
                    ));
                }
                session.set_state(SessionState::Streaming);
                Ok(Command::Respond {
                    turn: TurnFinalizer::wrap_text(&text),
                    origin: TurnOrigin::Text,
                })
            }

            (state, message) => Err(VoiceError::InvalidState {
                message: message.kind().to_string(),
                state: state.to_string(),
            }),
        }
    }

    /// Raw audio from a binary frame, in the default format.
    pub fn accept_binary(&self, session_id: &str, chunk: &[u8]) -> Result<Command, VoiceError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock();
        session.touch();
        match session.state() {
            SessionState::Ready | SessionState::ReceivingAudio => {
                self.append_audio(&mut session, chunk, &self.default_format)
            }
            SessionState::Closed => Err(VoiceError::SessionNotFound(session_id.to_string())),
            state => Err(VoiceError::InvalidState {
                message: "audio_data".to_string(),
                state: state.to_string(),
            }),
        }
    }

    fn append_audio(&self, session: &mut VoiceSession, chunk: &[u8], format: &str) -> Result<Command, VoiceError> {
        session.pending_audio_mut().append(chunk, format)?;
        session.set_state(SessionState::ReceivingAudio);
        Ok(Command::Buffered)
    }

    /// Carry out a turn claimed by `accept`.
    ///
    /// `emit` is never called once the session is closed. The session is back
    /// in `Ready` before the final message of the turn is emitted, so a client
    /// reacting to it is never told the session is busy.
    pub async fn run_turn<E>(&self, handle: SessionHandle, command: Command, mut emit: E) -> Result<(), VoiceError>
    where
        E: FnMut(Outbound),
    {
        let (turn, origin) = match command {
            Command::Finalize(audio) => match self.finalizer.finalize(audio).await {
                Ok(turn) => {
                    if !begin_streaming(&handle) {
                        return Err(VoiceError::Cancelled);
                    }
                    emit(Outbound::Transcription {
                        session_id: handle.id().to_string(),
                        text: turn.transcript.clone(),
                        confidence: turn.confidence,
                    });
                    (turn, TurnOrigin::Speech)
                }
                Err(e) => return finish(&handle, Err(e), &mut emit),
            },
            Command::Respond { turn, origin } => (turn, origin),
            Command::Buffered | Command::Reply(_) => return Ok(()),
        };

        let session_id = handle.id().to_string();
        let result = self
            .streamer
            .respond(&handle, &turn, |unit| {
                emit(Outbound::unit(origin, &session_id, unit.index, unit.text))
            })
            .await;

        let result = result.map(|text| {
            info!(session_id = %session_id, chars = text.len(), "Turn completed");
            Outbound::ResponseComplete {
                session_id: session_id.clone(),
                text,
            }
        });
        finish(&handle, result, &mut emit)
    }
}

/// Finalizing → Streaming, unless the session closed in the meantime.
fn begin_streaming(handle: &SessionHandle) -> bool {
    let mut session = handle.lock();
    if session.state() == SessionState::Closed {
        return false;
    }
    session.set_state(SessionState::Streaming);
    true
}

/// Release the session and emit the closing message of the turn.
fn finish<E>(handle: &SessionHandle, result: Result<Outbound, VoiceError>, emit: &mut E) -> Result<(), VoiceError>
where
    E: FnMut(Outbound),
{
    {
        let mut session = handle.lock();
        if session.state() == SessionState::Closed {
            return Err(VoiceError::Cancelled);
        }
        session.set_state(SessionState::Ready);
    }

    match result {
        Ok(message) => {
            emit(message);
            Ok(())
        }
        Err(VoiceError::Cancelled) => Err(VoiceError::Cancelled),
        Err(e) => {
            emit(Outbound::error(handle.id(), &e));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::{ScriptedCompletion, ScriptedSpeechToText, Step};
    use crate::providers::{SpeechToText, TextCompletion};
    use tokio::sync::{mpsc, Notify};

    struct Harness {
        dispatcher: Dispatcher,
        stt: Arc<ScriptedSpeechToText>,
        store: Arc<SessionStore>,
        session_id: String,
    }

    fn harness(stt: ScriptedSpeechToText, completion: ScriptedCompletion) -> Harness {
        harness_with_limit(stt, completion, 1024)
    }

    fn harness_with_limit(stt: ScriptedSpeechToText, completion: ScriptedCompletion, max_audio: usize) -> Harness {
        let store = Arc::new(SessionStore::new(8, max_audio));
        let stt = Arc::new(stt);
        let completion: Arc<dyn TextCompletion> = Arc::new(completion);
        let dispatcher = Dispatcher::new(
            store.clone(),
            TurnFinalizer::new(stt.clone() as Arc<dyn SpeechToText>),
            ResponseStreamer::new(completion, "Tutor.".to_string(), 10),
            "pcm16".to_string(),
        );
        let session_id = store.create("user-1", "lesson-1").unwrap();
        Harness {
            dispatcher,
            stt,
            store,
            session_id,
        }
    }

    impl Harness {
        /// Feed one message the way the socket actor does and collect what it emits.
        async fn send(&self, message: Inbound) -> Vec<Outbound> {
            let mut out = Vec::new();
            match self.dispatcher.accept(&self.session_id, message) {
                Ok(Command::Reply(reply)) => out.push(reply),
                Ok(command) if command.starts_turn() => {
                    let handle = self.store.get(&self.session_id).unwrap();
                    let _ = self
                        .dispatcher
                        .run_turn(handle, command, |message| out.push(message))
                        .await;
                }
                Ok(_) => {}
                Err(e) => out.push(Outbound::error(&self.session_id, &e)),
            }
            out
        }

        fn state(&self) -> SessionState {
            self.store.get(&self.session_id).unwrap().state()
        }
    }

    fn audio(bytes: &[u8]) -> Inbound {
        use base64::Engine;
        Inbound::AudioData {
            audio: base64::engine::general_purpose::STANDARD.encode(bytes),
            format: Some("pcm16".to_string()),
        }
    }

    fn text(text: &str) -> Inbound {
        Inbound::TextMessage {
            text: text.to_string(),
        }
    }

    fn error_code(message: &Outbound) -> Option<&str> {
        match message {
            Outbound::Error { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    #[actix_web::test]
    async fn test_spoken_turn_end_to_end() {
        let h = harness(
            ScriptedSpeechToText::returning("How do I say hello?"),
            ScriptedCompletion::fragments(&["You say hola. ", "Try it out loud now!"], 2),
        );

        for chunk in [&[1u8, 2][..], &[3][..], &[4, 5, 6][..]] {
            assert!(h.send(audio(chunk)).await.is_empty());
            assert_eq!(h.state(), SessionState::ReceivingAudio);
        }

        let out = h.send(Inbound::AudioEnd {}).await;
        let calls = h.stt.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0].0[..], &[1, 2, 3, 4, 5, 6]);

        assert!(matches!(&out[0], Outbound::Transcription { text, .. } if text == "How do I say hello?"));
        let units: Vec<&str> = out
            .iter()
            .filter_map(|m| match m {
                Outbound::SpeechResponse { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(!units.is_empty());
        assert_eq!(units.concat(), "You say hola. Try it out loud now!");
        assert!(matches!(out.last(), Some(Outbound::ResponseComplete { .. })));
        assert_eq!(h.state(), SessionState::Ready);

        // Back in Ready: a typed turn is accepted straight away.
        let out = h.send(text("Thanks")).await;
        assert!(out.iter().all(|m| error_code(m).is_none()));
        assert!(out.iter().any(|m| matches!(m, Outbound::TextResponse { .. })));
    }

    #[actix_web::test]
    async fn test_text_turn_never_transcribes() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::fragments(&["Hello to you as well."], 1),
        );

        let out = h.send(text("Hello")).await;
        assert!(!out.iter().any(|m| matches!(m, Outbound::Transcription { .. })));
        assert!(matches!(&out[0], Outbound::TextResponse { index: 0, .. }));
        assert!(h.stt.calls().is_empty());
    }

    #[actix_web::test]
    async fn test_audio_end_without_audio_is_empty_transcript() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
        );

        let out = h.send(Inbound::AudioEnd {}).await;
        assert_eq!(out.len(), 1);
        assert_eq!(error_code(&out[0]), Some("empty_transcript"));
        assert_eq!(h.state(), SessionState::Ready);
        assert!(h.stt.calls().is_empty());
    }

    #[actix_web::test]
    async fn test_empty_capture_is_empty_transcript() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
        );

        h.send(audio(&[])).await;
        let out = h.send(Inbound::AudioEnd {}).await;

        assert_eq!(out.len(), 1);
        assert_eq!(error_code(&out[0]), Some("empty_transcript"));
        assert_eq!(h.state(), SessionState::Ready);
        assert!(h.stt.calls().is_empty());
    }

    #[actix_web::test]
    async fn test_transcription_failure_returns_to_ready() {
        let h = harness(ScriptedSpeechToText::failing(), ScriptedCompletion::default());

        h.send(audio(&[1, 2])).await;
        let out = h.send(Inbound::AudioEnd {}).await;

        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            Outbound::Error { code, retryable: true, .. } if code == "transcription_failed"
        ));
        assert_eq!(h.state(), SessionState::Ready);

        // The failed capture is gone; the next turn starts empty.
        h.send(audio(&[9])).await;
        h.send(Inbound::AudioEnd {}).await;
        assert_eq!(&h.stt.calls()[1].0[..], &[9]);
    }

    #[actix_web::test]
    async fn test_partial_completion_failure_is_one_error_after_units() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::new(vec![vec![
                Step::Text("Here is the first part. "),
                Step::Text("And then"),
                Step::Fail,
            ]]),
        );

        let out = h.send(text("Tell me something")).await;
        let errors: Vec<&Outbound> = out.iter().filter(|m| error_code(m).is_some()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(error_code(errors[0]), Some("completion_failed"));
        assert!(matches!(out[0], Outbound::TextResponse { .. }));
        assert!(matches!(out.last(), Some(Outbound::Error { .. })));
        assert_eq!(h.state(), SessionState::Ready);
    }

    #[actix_web::test]
    async fn test_no_second_turn_while_busy() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
        );

        h.send(audio(&[1])).await;
        let command = h.dispatcher.accept(&h.session_id, Inbound::AudioEnd {}).unwrap();
        assert!(command.starts_turn());
        assert_eq!(h.state(), SessionState::Finalizing);

        for message in [Inbound::AudioEnd {}, text("Hi")] {
            assert!(matches!(
                h.dispatcher.accept(&h.session_id, message),
                Err(VoiceError::InvalidState { .. })
            ));
        }
        assert!(matches!(
            h.dispatcher.accept(&h.session_id, audio(&[2])),
            Err(VoiceError::InvalidState { .. })
        ));
        assert!(matches!(
            h.dispatcher.accept_binary(&h.session_id, &[2]),
            Err(VoiceError::InvalidState { .. })
        ));
        assert_eq!(h.state(), SessionState::Finalizing);

        // Ping is answered in any state.
        assert!(matches!(
            h.dispatcher.accept(&h.session_id, Inbound::Ping { timestamp: Some(1) }),
            Ok(Command::Reply(Outbound::Pong { timestamp: Some(1) }))
        ));
    }

    #[actix_web::test]
    async fn test_text_while_receiving_audio_is_rejected() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
        );

        h.send(audio(&[1, 2])).await;
        let out = h.send(text("Hi")).await;
        assert_eq!(error_code(&out[0]), Some("invalid_state"));
        assert_eq!(h.state(), SessionState::ReceivingAudio);
    }

    #[actix_web::test]
    async fn test_rejected_audio_leaves_state_alone() {
        let h = harness_with_limit(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
            4,
        );

        let out = h.send(audio(&[0; 8])).await;
        assert_eq!(error_code(&out[0]), Some("audio_too_large"));
        assert_eq!(h.state(), SessionState::Ready);

        let bad = Inbound::AudioData {
            audio: "@@@".to_string(),
            format: None,
        };
        assert_eq!(error_code(&h.send(bad).await[0]), Some("malformed_message"));
        assert_eq!(h.state(), SessionState::Ready);
    }

    #[actix_web::test]
    async fn test_binary_frames_use_default_format() {
        let h = harness(
            ScriptedSpeechToText::returning("Hi there"),
            ScriptedCompletion::fragments(&["Hello again, friend."], 1),
        );

        h.dispatcher.accept_binary(&h.session_id, &[5, 6]).unwrap();
        h.send(Inbound::AudioEnd {}).await;
        assert_eq!(h.stt.calls()[0].1, "pcm16");
    }

    #[actix_web::test]
    async fn test_unknown_session() {
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::default(),
        );
        assert_eq!(
            h.dispatcher.accept("missing", Inbound::AudioEnd {}).unwrap_err(),
            VoiceError::SessionNotFound("missing".to_string())
        );
    }

    #[actix_web::test]
    async fn test_close_during_streaming_silences_the_turn() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedSpeechToText::returning("unused"),
            ScriptedCompletion::new(vec![vec![
                Step::Text("This sentence is delivered. "),
                Step::Text("This one is"),
                Step::Wait(gate.clone()),
                Step::Text(" never heard. Nor is this one."),
            ]]),
        );

        let command = h.dispatcher.accept(&h.session_id, text("Go")).unwrap();
        let handle = h.store.get(&h.session_id).unwrap();
        let dispatcher = h.dispatcher.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = actix_web::rt::spawn(async move {
            dispatcher
                .run_turn(handle, command, move |message| {
                    let _ = tx.send(message);
                })
                .await
        });

        assert!(matches!(rx.recv().await, Some(Outbound::TextResponse { index: 0, .. })));
        assert!(h.store.close(&h.session_id));
        gate.notify_one();

        assert_eq!(task.await.unwrap().unwrap_err(), VoiceError::Cancelled);
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            h.dispatcher.accept(&h.session_id, text("late")),
            Err(VoiceError::SessionNotFound(_))
        ));
    }
}
