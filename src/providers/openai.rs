//! # OpenAI-compatible HTTP providers
//!
//! - **`OpenAiSpeechToText`**: multipart upload to `POST {base_url}/audio/transcriptions`
//! - **`OpenAiChatCompletion`**: `POST {base_url}/chat/completions` with `stream: true`,
//!   decoding the server-sent events as they arrive
//!
//! Both work against any server speaking the same wire format (local Whisper
//! servers, vLLM, Ollama's OpenAI endpoint, ...). One `reqwest::Client` per
//! provider is reused so connections are pooled.

use crate::config::{CompletionConfig, SpeechToTextConfig};
use crate::error::ProviderError;
use crate::providers::wav::{wrap_pcm16, PCM_SAMPLE_RATE};
use crate::providers::{CompletionRequest, SpeechToText, TextCompletion, TextStream, Transcript};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt, TryStreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn build_client(timeout_secs: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {e}")))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

// =============================================================================
// Speech to text
// =============================================================================

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    avg_logprob: Option<f64>,
}

/// Mean per-segment probability, from the segments' average log-probabilities.
fn confidence_from_segments(segments: &[TranscriptionSegment]) -> Option<f32> {
    let probs: Vec<f64> = segments
        .iter()
        .filter_map(|s| s.avg_logprob)
        .map(|lp| lp.exp().clamp(0.0, 1.0))
        .collect();
    if probs.is_empty() {
        return None;
    }
    Some((probs.iter().sum::<f64>() / probs.len() as f64) as f32)
}

fn mime_for(format: &str) -> &'static str {
    match format {
        "pcm16" | "wav" => "audio/wav",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiSpeechToText {
    client: Client,
    config: SpeechToTextConfig,
}

impl OpenAiSpeechToText {
    pub fn new(config: SpeechToTextConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            config,
        })
    }
}

#[async_trait]
impl SpeechToText for OpenAiSpeechToText {
    async fn transcribe(&self, audio: Bytes, format: &str) -> Result<Transcript, ProviderError> {
        let started = Instant::now();
        let (payload, extension) = if format == "pcm16" {
            let wav = wrap_pcm16(&audio, PCM_SAMPLE_RATE)
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            (wav, "wav")
        } else {
            (audio.to_vec(), format)
        };

        let file = Part::bytes(payload)
            .file_name(format!("utterance.{extension}"))
            .mime_str(mime_for(format))?;
        let mut form = Form::new()
            .part("file", file)
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json");
        if !self.config.language.is_empty() {
            form = form.text("language", self.config.language.clone());
        }

        let mut request = self
            .client
            .post(endpoint(&self.config.base_url, "audio/transcriptions"))
            .multipart(form);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = ensure_success(request.send().await?).await?;
        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        debug!(
            bytes = audio.len(),
            format = %format,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription finished"
        );

        Ok(Transcript {
            text: parsed.text.trim().to_string(),
            confidence: confidence_from_segments(&parsed.segments),
        })
    }
}

// =============================================================================
// Streaming chat completion
// =============================================================================

/// Incremental server-sent-events decoder.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence, so lines
/// are assembled from raw bytes before decoding.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !data.is_empty() {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
            // Blank lines, comments and `event:`/`id:` fields carry nothing we use.
        }

        events
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

/// Text carried by one `data:` payload, if any.
fn parse_chunk(data: &str) -> Result<Option<String>, ProviderError> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| ProviderError::Decode(format!("{e}: {data}")))?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::Decode(error.message));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

struct DeltaState<S> {
    bytes: Pin<Box<S>>,
    decoder: SseDecoder,
    queued: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

/// Turn a response body of server-sent events into reply fragments.
fn delta_stream<S>(bytes: S) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = DeltaState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::default(),
        queued: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in state.decoder.feed(&chunk) {
                        match event {
                            SseEvent::Done => {
                                state.finished = true;
                                break;
                            }
                            SseEvent::Data(data) => match parse_chunk(&data) {
                                Ok(Some(text)) => state.queued.push_back(Ok(text)),
                                Ok(None) => {}
                                Err(e) => {
                                    state.queued.push_back(Err(e));
                                    state.finished = true;
                                    break;
                                }
                            },
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.queued.push_back(Err(ProviderError::Transport(e)));
                }
                None => {
                    // Some servers close without `[DONE]`; treat end of body as end of reply.
                    state.finished = true;
                }
            }
        }
    })
}

#[derive(Debug, Clone)]
pub struct OpenAiChatCompletion {
    client: Client,
    config: CompletionConfig,
}

impl OpenAiChatCompletion {
    pub fn new(config: CompletionConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            config,
        })
    }
}

impl TextCompletion for OpenAiChatCompletion {
    fn complete(&self, request: CompletionRequest) -> TextStream {
        let body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "temperature": self.config.temperature,
            "stream": true,
        });

        let mut http = self
            .client
            .post(endpoint(&self.config.base_url, "chat/completions"))
            .json(&body);
        if !self.config.api_key.is_empty() {
            http = http.bearer_auth(&self.config.api_key);
        }

        let response = async move {
            let response = ensure_success(http.send().await?).await;
            if let Err(e) = &response {
                warn!(error = %e, "Completion request rejected");
            }
            response
        };

        stream::once(response)
            .map_ok(|response| delta_stream(response.bytes_stream()))
            .try_flatten()
            .boxed()
    }
}
