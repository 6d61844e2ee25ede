//! # Pending Audio Accumulation
//!
//! Collects the audio fragments of a single user utterance, in arrival order,
//! until the client sends `audio_end`. Nothing is decoded here: the bytes are
//! handed untouched to the speech-to-text capability, which is where a corrupt
//! or mislabeled payload surfaces.
//!
//! ## Memory Management:
//! - Appends extend one growable `Vec<u8>` (amortized O(1), prior bytes are never re-copied
//!   beyond `Vec`'s own doubling)
//! - A per-turn byte ceiling rejects the chunk that would cross it, so a client
//!   that never sends `audio_end` cannot grow the buffer without bound
//! - `take()` hands the buffer off and leaves an empty one behind, so the next
//!   turn starts clean

use crate::error::VoiceError;
use bytes::Bytes;

/// Format tags accepted on `audio_data`. `pcm16` is raw 16-bit little-endian mono.
pub const KNOWN_FORMATS: &[&str] = &["pcm16", "wav", "webm", "ogg", "mp3", "m4a", "flac"];

/// Normalize and check a client-supplied format tag.
pub fn normalize_format(format: &str) -> Result<String, VoiceError> {
    let tag = format.trim().to_ascii_lowercase();
    if tag.is_empty() || !KNOWN_FORMATS.contains(&tag.as_str()) {
        return Err(VoiceError::UnsupportedFormat(format.to_string()));
    }
    Ok(tag)
}

/// Audio captured for the current turn.
#[derive(Debug)]
pub struct PendingAudio {
    data: Vec<u8>,
    format: Option<String>,
    chunks: usize,
    max_bytes: usize,
}

/// A finished capture, ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    pub data: Bytes,
    pub format: String,
    pub chunks: usize,
}

impl CapturedAudio {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PendingAudio {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            format: None,
            chunks: 0,
            max_bytes,
        }
    }

    /// Append one fragment.
    ///
    /// The format of the first fragment fixes the format of the turn; a later
    /// fragment tagged differently is rejected rather than silently mixed in.
    pub fn append(&mut self, chunk: &[u8], format: &str) -> Result<(), VoiceError> {
        let format = normalize_format(format)?;

        if let Some(existing) = &self.format {
            if *existing != format {
                return Err(VoiceError::UnsupportedFormat(format!(
                    "{} (this turn is {})",
                    format, existing
                )));
            }
        }

        if self.data.len() + chunk.len() > self.max_bytes {
            return Err(VoiceError::AudioTooLarge {
                limit: self.max_bytes,
            });
        }

        self.data.extend_from_slice(chunk);
        self.format.get_or_insert(format);
        self.chunks += 1;
        Ok(())
    }

    /// Hand off everything captured so far and reset for the next turn.
    pub fn take(&mut self) -> CapturedAudio {
        let data = std::mem::take(&mut self.data);
        let format = self.format.take().unwrap_or_else(|| "pcm16".to_string());
        let chunks = std::mem::replace(&mut self.chunks, 0);
        CapturedAudio {
            data: Bytes::from(data),
            format,
            chunks,
        }
    }

    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.format = None;
        self.chunks = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_arrival_order() {
        let mut audio = PendingAudio::new(1024);
        audio.append(&[1, 2], "pcm16").unwrap();
        audio.append(&[3], "pcm16").unwrap();
        audio.append(&[4, 5, 6], "PCM16").unwrap();

        let captured = audio.take();
        assert_eq!(&captured.data[..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(captured.format, "pcm16");
        assert_eq!(captured.chunks, 3);
    }

    #[test]
    fn test_take_resets_buffer() {
        let mut audio = PendingAudio::new(1024);
        audio.append(&[9; 10], "wav").unwrap();
        let _ = audio.take();

        assert!(audio.is_empty());
        assert_eq!(audio.chunks(), 0);
        assert_eq!(audio.format(), None);
        // A new turn may use a different format.
        audio.append(&[1], "webm").unwrap();
        assert_eq!(audio.format(), Some("webm"));
    }

    #[test]
    fn test_rejects_unknown_or_empty_format() {
        let mut audio = PendingAudio::new(1024);
        assert!(matches!(
            audio.append(&[1], "aiff"),
            Err(VoiceError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            audio.append(&[1], "  "),
            Err(VoiceError::UnsupportedFormat(_))
        ));
        assert!(audio.is_empty());
    }

    #[test]
    fn test_rejects_mixed_formats_within_turn() {
        let mut audio = PendingAudio::new(1024);
        audio.append(&[1], "wav").unwrap();
        assert!(audio.append(&[2], "mp3").is_err());
        assert_eq!(audio.len(), 1);
    }

    #[test]
    fn test_byte_ceiling() {
        let mut audio = PendingAudio::new(4);
        audio.append(&[1, 2, 3], "pcm16").unwrap();
        assert_eq!(
            audio.append(&[4, 5], "pcm16").unwrap_err(),
            VoiceError::AudioTooLarge { limit: 4 }
        );
        // The rejected chunk leaves the buffer untouched; a fitting one still lands.
        audio.append(&[4], "pcm16").unwrap();
        assert_eq!(audio.len(), 4);
    }

    #[test]
    fn test_empty_chunk_is_recorded() {
        let mut audio = PendingAudio::new(16);
        audio.append(&[], "pcm16").unwrap();
        assert_eq!(audio.chunks(), 1);
        assert!(audio.take().is_empty());
    }
}
