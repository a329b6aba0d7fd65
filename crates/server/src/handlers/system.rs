//! Health, identity and signing-key discovery.

use crate::auth::Principal;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Unauthenticated readiness probe.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let ctx = state.coordinator.context();
    ctx.records
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("record store: {e}")))?;
    ctx.storage
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("object storage: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Response for the authenticated caller.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub principal: String,
    pub signing_enabled: bool,
}

/// GET /v1/auth/whoami - The principal the bearer token resolves to.
pub async fn whoami(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<Json<WhoamiResponse>> {
    Ok(Json(WhoamiResponse {
        principal: principal.name,
        signing_enabled: state.signer.is_some(),
    }))
}

/// Signing key discovery response.
#[derive(Debug, Serialize)]
pub struct SigningKeyResponse {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    /// `name:base64` form, what peers pin as a trusted key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// GET /v1/signing-key - Public half of the export signing key, if any.
pub async fn get_signing_key(
    State(state): State<AppState>,
    _principal: Principal,
) -> ApiResult<Json<SigningKeyResponse>> {
    use ferry_signer::Signer;

    let response = match &state.signer {
        Some(signer) => SigningKeyResponse {
            enabled: true,
            key_name: Some(signer.key_name().to_string()),
            public_key: Some(signer.public_key_string()),
        },
        None => SigningKeyResponse {
            enabled: false,
            key_name: None,
            public_key: None,
        },
    };
    Ok(Json(response))
}
