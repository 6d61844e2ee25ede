//! # Error Handling
//!
//! Two error families live here:
//!
//! - **`VoiceError`**: everything that can go wrong inside a voice session. These
//!   never become HTTP responses; the dispatcher turns each one into exactly one
//!   protocol `error` message with a stable machine-readable `code`.
//! - **`AppError`**: failures on the HTTP surface (config endpoints, the
//!   WebSocket upgrade). Converted into JSON responses through actix's
//!   `ResponseError`.
//!
//! ## Error Categories (voice):
//! - **Protocol errors** (`InvalidState`, `SessionNotFound`, `MalformedMessage`, ...):
//!   client bugs, reported and otherwise ignored; the session state is untouched.
//! - **Capability errors** (`TranscriptionFailed`, `CompletionFailed`): the
//!   session goes back to `Ready` so the user can simply try again.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors produced by the voice conversation core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VoiceError {
    /// A message arrived in a state with no transition for it.
    #[error("Unexpected '{message}' while session is {state}")]
    InvalidState { message: String, state: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Finalize was reached with nothing to transcribe (no audio, or silence).
    #[error("No speech was captured for this turn")]
    EmptyTranscript,

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    /// `partial` is true when some sentence units were already delivered.
    #[error("Completion failed{}: {detail}", partial_suffix(.partial))]
    CompletionFailed { detail: String, partial: bool },

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Pending audio would exceed the {limit} byte limit for a single turn")]
    AudioTooLarge { limit: usize },

    #[error("Unsupported audio format: '{0}'")]
    UnsupportedFormat(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Maximum concurrent sessions ({0}) reached")]
    SessionLimitReached(usize),

    /// The session closed while a turn was in flight. Never reported to a client.
    #[error("Session closed before the turn completed")]
    Cancelled,
}

fn partial_suffix(partial: &bool) -> &'static str {
    if *partial {
        " after a partial reply"
    } else {
        ""
    }
}

impl VoiceError {
    /// Stable code sent in protocol `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            VoiceError::InvalidState { .. } => "invalid_state",
            VoiceError::SessionNotFound(_) => "session_not_found",
            VoiceError::EmptyTranscript => "empty_transcript",
            VoiceError::TranscriptionFailed(_) => "transcription_failed",
            VoiceError::CompletionFailed { .. } => "completion_failed",
            VoiceError::AuthenticationRequired => "authentication_required",
            VoiceError::AudioTooLarge { .. } => "audio_too_large",
            VoiceError::UnsupportedFormat(_) => "unsupported_format",
            VoiceError::MalformedMessage(_) => "malformed_message",
            VoiceError::SessionLimitReached(_) => "session_limit_reached",
            VoiceError::Cancelled => "cancelled",
        }
    }

    /// Whether repeating the same action may succeed.
    ///
    /// Lets a client tell "try again" (a provider hiccup, nothing was heard)
    /// apart from "this will keep failing" (bad format, bad state, no access).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            VoiceError::EmptyTranscript
                | VoiceError::TranscriptionFailed(_)
                | VoiceError::CompletionFailed { .. }
                | VoiceError::SessionLimitReached(_)
        )
    }
}

/// Errors returned by the external speech-to-text and completion capabilities.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("provider configuration error: {0}")]
    Config(String),
}

/// HTTP-facing application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// JSON error body:
///
/// ```json
/// {
///   "error": {
///     "type": "unauthorized",
///     "message": "Authentication required",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::Unauthorized(msg) => ("unauthorized", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::Unavailable(msg) => ("unavailable", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::AuthenticationRequired => AppError::Unauthorized(err.to_string()),
            VoiceError::SessionLimitReached(_) => AppError::Unavailable(err.to_string()),
            VoiceError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
