//! # Connection Authentication
//!
//! Resolves the credential presented on the WebSocket upgrade to a user id
//! before any session exists. Token issuance lives elsewhere; this service
//! only checks what it is given.
//!
//! ## Credential Sources (first match wins):
//! 1. `Authorization: Bearer <token>` header
//! 2. `?token=<token>` query parameter (browsers cannot set headers on a WebSocket upgrade)

use crate::error::VoiceError;
use actix_web::http::header;
use actix_web::HttpRequest;
use serde::Deserialize;
use std::collections::HashMap;

/// Maps a presented credential to the user it belongs to.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, credential: &str) -> Option<String>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve(&self, credential: &str) -> Option<String> {
        self.tokens.get(credential).cloned()
    }
}

/// Query parameters accepted on `/ws/voice`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub lesson_id: Option<String>,
}

/// Who is connecting, and to talk about what.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub user_id: String,
    pub lesson_context_id: String,
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticate an upgrade request. No credential, or an unknown one, is
/// `AuthenticationRequired`; a missing `lesson_id` falls back to `"general"`.
pub fn authenticate(
    req: &HttpRequest,
    params: &ConnectParams,
    resolver: &dyn IdentityResolver,
) -> Result<Connection, VoiceError> {
    let credential = bearer_token(req)
        .or(params.token.as_deref())
        .ok_or(VoiceError::AuthenticationRequired)?;

    let user_id = resolver
        .resolve(credential)
        .ok_or(VoiceError::AuthenticationRequired)?;

    let lesson_context_id = params
        .lesson_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .unwrap_or("general")
        .to_string();

    Ok(Connection {
        user_id,
        lesson_context_id,
    })
}
