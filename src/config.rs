//! # Configuration Management
//!
//! Loads application configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix (`APP_VOICE__IDLE_TIMEOUT_SECS=120`)
//! - The `HOST` / `PORT` variables most deployment platforms inject
//!
//! ## Sections:
//! - **server**: bind address
//! - **voice**: per-session limits (audio ceiling, idle timeout, heartbeat)
//! - **speech_to_text / completion**: the external capabilities the core drives
//! - **auth**: static credential table used by the identity resolver
//! - **performance**: process-wide session ceiling

use crate::voice::buffer::{normalize_format, KNOWN_FORMATS};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub speech_to_text: SpeechToTextConfig,
    pub completion: CompletionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Limits that apply to every voice session.
///
/// `max_pending_audio_bytes` bounds the audio buffered for a single turn;
/// appends beyond it are rejected with `audio_too_large` instead of growing
/// the buffer without bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub max_pending_audio_bytes: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Format tag applied to binary WebSocket frames, which carry no tag of their own.
    pub default_audio_format: String,
    /// Reply segments shorter than this are merged into the preceding unit.
    pub min_sentence_chars: usize,
}

impl VoiceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// OpenAI-compatible transcription endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct SpeechToTextConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub timeout_secs: u64,
    /// ISO 639-1 hint passed to the provider; empty means auto-detect.
    #[serde(default)]
    pub language: String,
}

/// OpenAI-compatible streaming chat completion endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    /// `{lesson}` is replaced by the session's lesson context id.
    pub system_prompt: String,
}

// Hand-written so the API keys never reach the logs.
impl fmt::Debug for SpeechToTextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechToTextConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("language", &self.language)
            .finish()
    }
}

impl fmt::Debug for CompletionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Static bearer tokens mapped to user ids.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing)]
    pub tokens: HashMap<String, String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("tokens", &format!("[{} REDACTED]", self.tokens.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            voice: VoiceConfig {
                max_pending_audio_bytes: 10 * 1024 * 1024, // 10 MiB, ~5 minutes of 16kHz PCM
                idle_timeout_secs: 300,
                heartbeat_interval_secs: 30,
                default_audio_format: "pcm16".to_string(),
                min_sentence_chars: 10,
            },
            speech_to_text: SpeechToTextConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "whisper-1".to_string(),
                api_key: String::new(),
                timeout_secs: 60,
                language: String::new(),
            },
            completion: CompletionConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                api_key: String::new(),
                timeout_secs: 120,
                temperature: 0.7,
                system_prompt: "You are a friendly spoken-language tutor. Keep replies short and \
                                conversational. The current lesson is: {lesson}."
                    .to_string(),
            },
            auth: AuthConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

const RESTART_ONLY: &[(&str, &str)] = &[
    ("server", "host"),
    ("server", "port"),
    ("voice", "max_pending_audio_bytes"),
    ("voice", "default_audio_format"),
    ("voice", "min_sentence_chars"),
    ("completion", "temperature"),
    ("completion", "system_prompt"),
    ("performance", "max_concurrent_sessions"),
];

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment, in that order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.voice.max_pending_audio_bytes == 0 {
            return Err(anyhow::anyhow!("Max pending audio bytes must be greater than 0"));
        }

        if self.voice.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }

        if self.voice.heartbeat_interval_secs == 0
            || self.voice.heartbeat_interval_secs >= self.voice.idle_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be between 1 and the idle timeout ({}s)",
                self.voice.idle_timeout_secs
            ));
        }

        normalize_format(&self.voice.default_audio_format).map_err(|_| {
            anyhow::anyhow!(
                "Default audio format '{}' is not one of {}",
                self.voice.default_audio_format,
                KNOWN_FORMATS.join(", ")
            )
        })?;

        if self.speech_to_text.base_url.is_empty() || self.speech_to_text.model.is_empty() {
            return Err(anyhow::anyhow!("Speech-to-text base_url and model are required"));
        }

        if self.completion.base_url.is_empty() || self.completion.model.is_empty() {
            return Err(anyhow::anyhow!("Completion base_url and model are required"));
        }

        Ok(())
    }

    /// Keys in a partial update that are copied into long-lived components at
    /// startup. Changing them updates the stored config but takes effect only
    /// after a restart.
    pub fn restart_required(partial: &serde_json::Value) -> Vec<String> {
        RESTART_ONLY
            .iter()
            .filter(|(section, key)| partial.get(section).and_then(|s| s.get(key)).is_some())
            .map(|(section, key)| format!("{}.{}", section, key))
            .collect()
    }

    /// Apply a partial JSON document (runtime config updates) and re-validate.
    ///
    /// Only operational knobs are updatable at runtime; provider endpoints and
    /// credentials require a restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(voice) = partial_config.get("voice") {
            if let Some(bytes) = voice.get("max_pending_audio_bytes").and_then(|v| v.as_u64()) {
                self.voice.max_pending_audio_bytes = bytes as usize;
            }
            if let Some(secs) = voice.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.voice.idle_timeout_secs = secs;
            }
            if let Some(secs) = voice.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.voice.heartbeat_interval_secs = secs;
            }
            if let Some(format) = voice.get("default_audio_format").and_then(|v| v.as_str()) {
                self.voice.default_audio_format = format.to_string();
            }
            if let Some(chars) = voice.get("min_sentence_chars").and_then(|v| v.as_u64()) {
                self.voice.min_sentence_chars = chars as usize;
            }
        }

        if let Some(completion) = partial_config.get("completion") {
            if let Some(temperature) = completion.get("temperature").and_then(|v| v.as_f64()) {
                self.completion.temperature = temperature as f32;
            }
            if let Some(prompt) = completion.get("system_prompt").and_then(|v| v.as_str()) {
                self.completion.system_prompt = prompt.to_string();
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
