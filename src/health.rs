//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus a load summary
//! - `GET /api/v1/metrics`: per-endpoint HTTP statistics and voice counters
//! - `GET /api/v1/sessions`: live voice sessions (no audio, no history text)

use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let active_sessions = state.active_sessions();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "active_sessions": active_sessions
        },
        "providers": {
            "speech_to_text": {
                "base_url": config.speech_to_text.base_url,
                "model": config.speech_to_text.model
            },
            "completion": {
                "base_url": config.completion.base_url,
                "model": config.completion.model
            }
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, active_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "endpoints": endpoint_stats,
        "voice": {
            "active_sessions": state.active_sessions(),
            "max_concurrent_sessions": state.sessions.max_sessions(),
            "counters": metrics.voice
        },
        "memory": get_memory_info()
    }))
}

pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.sessions.summaries();
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    }))
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let kib = |key: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(key))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": kib("VmRSS:"),
                "virtual_memory_bytes": kib("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(config: &AppConfig, active_sessions: usize) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = ratio(active_sessions as u64, max_sessions as u64);

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::ScriptedCompletion;
    use crate::state::tests::test_state;
    use actix_web::{test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_health_reports_sessions() {
        let state = test_state(ScriptedCompletion::default());
        state.sessions.create("u", "l").unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;
        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metrics"]["active_sessions"], 1);
        assert_eq!(body["system"]["max_sessions"], 2);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[actix_web::test]
    async fn test_metrics_include_voice_counters() {
        let state = test_state(ScriptedCompletion::default());
        state.record_voice(|v| v.turns_completed += 2);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;
        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;

        assert_eq!(body["voice"]["counters"]["turns_completed"], 2);
        assert_eq!(body["voice"]["max_concurrent_sessions"], 2);
    }

    #[actix_web::test]
    async fn test_list_sessions() {
        let state = test_state(ScriptedCompletion::default());
        let id = state.sessions.create("user-9", "lesson-3").unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/sessions", web::get().to(list_sessions)),
        )
        .await;
        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/sessions").to_request()).await;

        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["session_id"], id.as_str());
        assert_eq!(body["sessions"][0]["state"], "ready");
    }

    #[actix_web::test]
    async fn test_system_status_thresholds() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 10;
        assert_eq!(get_system_status(&config, 8)["status"], "moderate_load");
        assert_eq!(get_system_status(&config, 10)["status"], "high_load");
        assert_eq!(get_system_status(&config, 1)["status"], "normal");
    }
}
