//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket actor through
//! `web::Data<AppState>`. Cloning an `AppState` clones `Arc`s, never the data.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration
//! - **metrics**: HTTP and voice counters for `/api/v1/metrics`
//! - **sessions**: the process-wide voice `SessionStore`
//! - **dispatcher**: the voice state machine, wired to the configured providers
//! - **identity**: credential → user id resolution for the upgrade handshake
//!
//! ## Thread Safety:
//! Config and metrics sit behind `Arc<RwLock<T>>`; locks are held only for
//! the duration of a copy or a counter bump. The session store does its own
//! per-session locking.

use crate::auth::{IdentityResolver, StaticTokenResolver};
use crate::config::AppConfig;
use crate::providers::{OpenAiChatCompletion, OpenAiSpeechToText, SpeechToText, TextCompletion};
use crate::voice::{Dispatcher, ResponseStreamer, SessionStore, TurnFinalizer};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the metrics middleware and the voice sockets
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub sessions: Arc<SessionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub identity: Arc<dyn IdentityResolver>,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of HTTP requests that ended in an error status
    pub error_count: u64,

    /// Per-endpoint statistics. Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub voice: VoiceMetrics,
}

/// Voice conversation counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct VoiceMetrics {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub sessions_rejected: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub turns_cancelled: u64,
    pub units_delivered: u64,
    pub protocol_errors: u64,
}

/// Detailed metrics for one endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time in milliseconds
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Build the state with the OpenAI-compatible providers described by `config`.
    pub fn new(config: AppConfig) -> Result<Self> {
        let stt = OpenAiSpeechToText::new(config.speech_to_text.clone())
            .context("Failed to create speech-to-text client")?;
        let completion = OpenAiChatCompletion::new(config.completion.clone())
            .context("Failed to create completion client")?;
        let identity = StaticTokenResolver::new(config.auth.tokens.clone());

        Ok(Self::with_providers(
            config,
            Arc::new(stt),
            Arc::new(completion),
            Arc::new(identity),
        ))
    }

    /// Build the state around explicit capability implementations.
    pub fn with_providers(
        config: AppConfig,
        stt: Arc<dyn SpeechToText>,
        completion: Arc<dyn TextCompletion>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(
            config.performance.max_concurrent_sessions,
            config.voice.max_pending_audio_bytes,
        ));
        let dispatcher = Dispatcher::new(
            sessions.clone(),
            TurnFinalizer::new(stt),
            ResponseStreamer::new(
                completion,
                config.completion.system_prompt.clone(),
                config.voice.min_sentence_chars,
            ),
            config.voice.default_audio_format.clone(),
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
            dispatcher: Arc::new(dispatcher),
            identity,
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so readers never block writers
    /// for longer than the copy.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Session ceilings and provider settings are read when the state is
    /// built; a change to those takes effect on restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<()> {
        new_config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against `endpoint` (e.g. "GET /api/v1/health").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Apply a change to the voice counters.
    pub fn record_voice(&self, update: impl FnOnce(&mut VoiceMetrics)) {
        update(&mut self.metrics_mut().voice);
    }

    /// Consistent copy of all counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
