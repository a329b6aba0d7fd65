//! Import requests.

use crate::auth::Principal;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use ferry_mirror::ImportOutcome;
use serde::Deserialize;

/// Request body for `POST /v1/imports`.
#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    /// Object key in the exports bucket.
    pub key: String,
}

/// POST /v1/imports - Import a published archive and wait for the result.
pub async fn import_archive(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<ImportOutcome>> {
    validate_key(&req.key)?;

    tracing::info!(key = %req.key, principal = %principal.name, "Import requested");
    let result = state.coordinator.import(&req.key).await;
    let kind = result.as_ref().ok().map(|o| o.metadata.kind_name());
    metrics::record_import(kind, &result);

    Ok(Json(result?))
}

/// Keys are relative object paths without traversal components.
fn validate_key(key: &str) -> ApiResult<()> {
    if key.is_empty() {
        return Err(ApiError::BadRequest("key is required".to_string()));
    }
    if key.starts_with('/') || key.split('/').any(|seg| seg.is_empty() || seg == "..") {
        return Err(ApiError::BadRequest(format!("invalid key: {key}")));
    }
    Ok(())
}
