//! # Lesson Voice Backend - Main Application Entry Point
//!
//! Real-time spoken tutoring over WebSocket: the client streams microphone
//! audio, the server transcribes it, asks a language model for a reply and
//! streams that reply back sentence by sentence while it is still being
//! generated.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, `APP_*` env vars)
//! - **state**: shared application state, metrics and the voice session store
//! - **voice**: the conversation core (sessions, segmentation, state machine)
//! - **providers**: speech-to-text and completion clients
//! - **auth**: credential resolution for the WebSocket upgrade
//! - **websocket**: one actor per voice connection
//! - **health / handlers / middleware**: the operational HTTP surface
//! - **error**: error taxonomy and HTTP error responses

mod auth;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod providers;
mod state;
mod voice;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives; polled by `wait_for_shutdown`.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        stt_model = %config.speech_to_text.model,
        completion_model = %config.completion.model,
        "Configuration loaded"
    );
    if config.auth.tokens.is_empty() {
        warn!("No auth tokens configured; every voice connection will be rejected");
    }

    let app_state = AppState::new(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    spawn_idle_sweeper(app_state.clone(), &config);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Registered last, runs first: CORS → request span → metrics
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::get().to(health::list_sessions))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to stdout. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lesson_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Periodically evict sessions whose connection stopped talking without
/// closing. Each socket also watches its own session; this catches the rest.
fn spawn_idle_sweeper(app_state: AppState, config: &AppConfig) {
    let idle_timeout = config.voice.idle_timeout();
    let period = config.voice.heartbeat_interval().max(Duration::from_secs(1));

    actix_web::rt::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = app_state.sessions.evict_idle(idle_timeout);
            if !evicted.is_empty() {
                app_state.record_voice(|v| v.sessions_closed += evicted.len() as u64);
                info!(count = evicted.len(), "Evicted idle voice sessions");
            }
        }
    });
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
