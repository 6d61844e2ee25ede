//! # Voice Conversation Core
//!
//! Turns one WebSocket connection into a spoken tutoring conversation:
//! audio in, transcript, streamed reply out, one sentence at a time.
//!
//! ## Components:
//! - **session**: per-connection state and the process-wide `SessionStore`
//! - **buffer**: accumulation of one utterance's audio
//! - **finalizer**: speech-to-text for a finished capture
//! - **segmenter**: incremental sentence splitting of a growing reply
//! - **streamer**: completion streaming and history bookkeeping
//! - **protocol**: inbound/outbound message types
//! - **dispatcher**: the state machine tying the above together

pub mod buffer;
pub mod dispatcher;
pub mod finalizer;
pub mod protocol;
pub mod segmenter;
pub mod session;
pub mod streamer;

pub use dispatcher::{Command, Dispatcher};
pub use finalizer::TurnFinalizer;
pub use protocol::{Inbound, Outbound};
pub use session::SessionStore;
pub use streamer::ResponseStreamer;
