//! Runtime configuration endpoints. Secrets (API keys, auth tokens) are never echoed.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

fn redacted(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": config.server,
        "voice": config.voice,
        "speech_to_text": {
            "base_url": config.speech_to_text.base_url,
            "model": config.speech_to_text.model,
            "timeout_secs": config.speech_to_text.timeout_secs,
            "language": config.speech_to_text.language,
            "api_key_set": !config.speech_to_text.api_key.is_empty()
        },
        "completion": {
            "base_url": config.completion.base_url,
            "model": config.completion.model,
            "timeout_secs": config.completion.timeout_secs,
            "temperature": config.completion.temperature,
            "system_prompt": config.completion.system_prompt,
            "api_key_set": !config.completion.api_key.is_empty()
        },
        "auth": {
            "token_count": config.auth.tokens.len()
        },
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let partial = body.into_inner();
    let restart_required = AppConfig::restart_required(&partial);
    let json_str = serde_json::to_string(&partial)?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    let message = if restart_required.is_empty() {
        "Configuration updated successfully"
    } else {
        "Configuration updated; some settings apply after a restart"
    };

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": message,
        "restart_required": restart_required,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::ScriptedCompletion;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_get_config_hides_secrets() {
        let state = test_state(ScriptedCompletion::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["auth"]["token_count"], 1);
        assert!(body["config"]["completion"].get("api_key").is_none());
        assert!(!body.to_string().contains("test-token"));
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = test_state(ScriptedCompletion::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"voice": {"idle_timeout_secs": 600}}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["restart_required"], json!([]));
        assert_eq!(state.get_config().voice.idle_timeout_secs, 600);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"voice": {"min_sentence_chars": 20}}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["restart_required"], json!(["voice.min_sentence_chars"]));

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"voice": {"heartbeat_interval_secs": 9000}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().voice.heartbeat_interval_secs, 30);
    }
}
