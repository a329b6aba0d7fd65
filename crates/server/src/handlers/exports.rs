//! Export requests.
//!
//! Validation and authorization run synchronously so the caller sees 400/403
//! immediately. Archive streaming continues in a background task whose
//! progress is visible through `GET /v1/exports/{export_id}`.

use crate::auth::Principal;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::{AppState, ExportStatus};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use ferry_core::ImportKindName;
use ferry_mirror::ExportTarget;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Request body for `POST /v1/exports/files`.
#[derive(Debug, Deserialize)]
pub struct FileExportRequest {
    pub model_id: String,
    pub file_id: String,
}

/// Request body for `POST /v1/exports/images`.
#[derive(Debug, Deserialize)]
pub struct ImageExportRequest {
    pub model_id: String,
    /// Release semver.
    pub release: String,
    pub image_name: String,
    pub tag: String,
}

/// Response for an accepted export.
#[derive(Debug, Serialize)]
pub struct ExportAccepted {
    pub export_id: String,
    /// Object key in the exports bucket once the archive is published.
    pub key: String,
    pub import_kind: ImportKindName,
    pub signed: bool,
}

/// POST /v1/exports/files - Export one model file.
pub async fn export_file(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<FileExportRequest>,
) -> ApiResult<(StatusCode, Json<ExportAccepted>)> {
    require_field("model_id", &req.model_id)?;
    require_field("file_id", &req.file_id)?;
    start_export(
        &state,
        &principal,
        ExportTarget::File {
            model_id: req.model_id,
            file_id: req.file_id,
        },
    )
    .await
}

/// POST /v1/exports/images - Export one release image.
pub async fn export_image(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<ImageExportRequest>,
) -> ApiResult<(StatusCode, Json<ExportAccepted>)> {
    require_field("model_id", &req.model_id)?;
    require_field("release", &req.release)?;
    require_field("image_name", &req.image_name)?;
    require_field("tag", &req.tag)?;
    start_export(
        &state,
        &principal,
        ExportTarget::Image {
            model_id: req.model_id,
            release: req.release,
            image_name: req.image_name,
            tag: req.tag,
        },
    )
    .await
}

/// GET /v1/exports/{export_id} - Status of an export started by this server.
pub async fn get_export(
    State(state): State<AppState>,
    _principal: Principal,
    Path(export_id): Path<String>,
) -> ApiResult<Json<ExportStatus>> {
    state
        .exports
        .get(&export_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("export {export_id}")))
}

fn require_field(name: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{name} is required")));
    }
    Ok(())
}

async fn start_export(
    state: &AppState,
    principal: &Principal,
    target: ExportTarget,
) -> ApiResult<(StatusCode, Json<ExportAccepted>)> {
    let kind = target.kind();
    let mut prepared = state
        .coordinator
        .prepare_export(&principal.name, target)
        .await?;

    let accepted = ExportAccepted {
        export_id: prepared.export_id().to_string(),
        key: prepared.key().to_string(),
        import_kind: kind,
        signed: state.signer.is_some(),
    };

    tracing::info!(
        export_id = %accepted.export_id,
        import_kind = %kind,
        key = %accepted.key,
        principal = %principal.name,
        "Export accepted"
    );

    state
        .exports
        .start(&accepted.export_id, &accepted.key, kind)
        .await;
    metrics::EXPORTS_STARTED
        .with_label_values(&[kind.as_str()])
        .inc();
    metrics::ACTIVE_EXPORTS.inc();

    let coordinator = state.coordinator.clone();
    let tracker = state.exports.clone();
    let export_id = accepted.export_id.clone();
    let handle = tokio::spawn(async move {
        let started = Instant::now();
        let result = coordinator.run_export(&mut prepared).await;
        metrics::record_export(kind, &result, started.elapsed());
        metrics::ACTIVE_EXPORTS.dec();
        tracker.finish(prepared.export_id(), &result).await;
    });
    state.exports.register(&export_id, handle).await;

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
