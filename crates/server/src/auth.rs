//! Bearer-token authentication and request trace ids.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use ferry_core::config::AuthConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::Instrument;
use uuid::Uuid;

/// Client trace ids longer than this are truncated.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sanitize a client-provided value: at most `MAX_TRACE_ID_LEN` chars,
    /// printable ASCII only. Falls back to a fresh id when nothing is left.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The principal a request acts as. Exports are authorized against this name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }
}

/// Token hash to principal name, built once from configuration.
#[derive(Clone, Debug, Default)]
pub struct PrincipalIndex {
    by_hash: HashMap<String, String>,
}

impl PrincipalIndex {
    pub fn from_config(config: &AuthConfig) -> Self {
        let by_hash = config
            .principals
            .iter()
            .map(|p| (p.token_hash.to_ascii_lowercase(), p.name.clone()))
            .collect();
        Self { by_hash }
    }

    /// Resolve a raw bearer token.
    pub fn resolve(&self, token: &str) -> Option<Principal> {
        self.by_hash.get(&hash_token(token)).map(|name| Principal {
            name: name.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

/// Hex SHA-256 of a token, the form stored in configuration.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Extract the bearer token. The scheme is case-insensitive (RFC 6750).
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Resolve the bearer token to a [`Principal`] and run the request inside a
/// span carrying the trace id. A token that matches no principal is rejected
/// outright; a missing token is left for the handler to reject if it needs one.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    let principal = match extract_bearer_token(&req) {
        Some(token) => Some(
            state
                .principals
                .resolve(token)
                .ok_or_else(|| ApiError::Unauthorized("unknown token".to_string()))?,
        ),
        None => None,
    };

    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id_str,
        principal = principal.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
    );
    if let Some(principal) = principal {
        req.extensions_mut().insert(principal);
    }

    Ok(next.run(req).instrument(span).await)
}
