//! # Voice Session Management
//!
//! Owns all mutable per-connection conversation state. Each WebSocket
//! connection gets exactly one `VoiceSession`, registered in the process-wide
//! `SessionStore` under a freshly generated UUID.
//!
//! ## Session Lifecycle:
//! 1. **Ready**: waiting for the user to speak or type
//! 2. **ReceivingAudio**: audio fragments are being accumulated
//! 3. **Finalizing**: the captured audio is being transcribed
//! 4. **Streaming**: the assistant reply is being generated and delivered
//! 5. **Closed**: terminal; the connection went away or idled out
//!
//! ## Thread Safety:
//! The store map is behind an `RwLock` that is only held long enough to look
//! up, insert or remove an entry. Every session has its own `Mutex`, so work on
//! session A never waits on session B. Session locks are never held across an
//! `.await`.

use crate::error::VoiceError;
use crate::voice::buffer::PendingAudio;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Protocol state of a session. Transitions are driven by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Ready,
    ReceivingAudio,
    Finalizing,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::ReceivingAudio => "receiving_audio",
            SessionState::Finalizing => "finalizing",
            SessionState::Streaming => "streaming",
            SessionState::Closed => "closed",
        }
    }

    /// True while a finalize-and-respond cycle owns the session.
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Finalizing | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Server-side state for one connection's conversation.
#[derive(Debug)]
pub struct VoiceSession {
    id: String,
    user_id: String,
    lesson_context_id: String,
    state: SessionState,
    pending_audio: PendingAudio,
    history: Vec<Turn>,
    last_activity_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl VoiceSession {
    fn new(id: String, user_id: String, lesson_context_id: String, max_audio_bytes: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            lesson_context_id,
            state: SessionState::Ready,
            pending_audio: PendingAudio::new(max_audio_bytes),
            history: Vec::new(),
            last_activity_at: now,
            created_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn lesson_context_id(&self) -> &str {
        &self.lesson_context_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. `Closed` is terminal and can never be left.
    pub fn set_state(&mut self, next: SessionState) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!(session_id = %self.id, from = %self.state, to = %next, "Session state change");
        self.state = next;
    }

    pub fn pending_audio(&self) -> &PendingAudio {
        &self.pending_audio
    }

    pub fn pending_audio_mut(&mut self) -> &mut PendingAudio {
        &mut self.pending_audio
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Append-only; existing entries are never edited or reordered.
    pub fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_activity_at)
            .to_std()
            .unwrap_or_default()
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
        self.pending_audio.clear();
    }
}

/// Shared handle to one session. Cloning is cheap; all clones see the same state.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    inner: Arc<Mutex<VoiceSession>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lock the session. A poisoned lock still yields the data: session state
    /// is plain values with no invariants spanning a panic.
    pub fn lock(&self) -> MutexGuard<'_, VoiceSession> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }
}

/// Snapshot used by the debug/metrics endpoints.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub lesson_context_id: String,
    pub state: SessionState,
    pub turns: usize,
    pub pending_audio_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Process-wide registry of live sessions.
///
/// Created once at startup and handed to every connection through `AppState`;
/// entries are removed as soon as a session closes.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_sessions: usize,
    max_audio_bytes: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize, max_audio_bytes: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            max_audio_bytes,
        }
    }

    /// Register a new session and return its id.
    ///
    /// Ids are random v4 UUIDs, so an id is never handed out twice.
    pub fn create(&self, user_id: &str, lesson_context_id: &str) -> Result<String, VoiceError> {
        self.create_handle(user_id, lesson_context_id)
            .map(|handle| handle.id().to_string())
    }

    /// Same as `create`, returning the handle so the caller can skip a lookup.
    pub fn create_handle(
        &self,
        user_id: &str,
        lesson_context_id: &str,
    ) -> Result<SessionHandle, VoiceError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_sessions {
            return Err(VoiceError::SessionLimitReached(self.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let session = VoiceSession::new(
            id.clone(),
            user_id.to_string(),
            lesson_context_id.to_string(),
            self.max_audio_bytes,
        );
        let handle = SessionHandle {
            id: Arc::from(id.as_str()),
            inner: Arc::new(Mutex::new(session)),
        };
        sessions.insert(id.clone(), handle.clone());

        info!(session_id = %id, user_id = %user_id, lesson = %lesson_context_id, "Voice session created");
        Ok(handle)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionHandle, VoiceError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| VoiceError::SessionNotFound(session_id.to_string()))
    }

    /// Close and evict a session. Returns false if it was already gone.
    ///
    /// The session is marked `Closed` before it leaves the map, so a turn still
    /// holding a handle observes the terminal state and stops delivering.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(session_id)
        };

        match removed {
            Some(handle) => {
                handle.lock().close();
                info!(session_id = %session_id, "Voice session closed");
                true
            }
            None => false,
        }
    }

    /// Close every session idle for longer than `max_idle`. Sessions in the
    /// middle of a turn are left alone. Returns the evicted ids.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Utc::now();
        let stale: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .values()
                .filter(|handle| {
                    let session = handle.lock();
                    !session.state().is_busy() && session.idle_for(now) > max_idle
                })
                .map(|handle| handle.id().to_string())
                .collect()
        };

        stale
            .into_iter()
            .filter(|id| self.close(id))
            .inspect(|id| info!(session_id = %id, "Evicted idle voice session"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .values()
            .map(|handle| {
                let session = handle.lock();
                SessionSummary {
                    session_id: session.id().to_string(),
                    user_id: session.user_id().to_string(),
                    lesson_context_id: session.lesson_context_id().to_string(),
                    state: session.state(),
                    turns: session.history().len(),
                    pending_audio_bytes: session.pending_audio().len(),
                    created_at: session.created_at(),
                    last_activity_at: session.last_activity_at(),
                }
            })
            .collect()
    }
}
