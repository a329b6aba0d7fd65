//! Prometheus metrics for the ferry server.
//!
//! Covers export and import throughput, registry blob deduplication, and
//! export duration. Labels carry the import kind and outcome only, never model
//! ids or keys.
//!
//! The `/metrics` endpoint is unauthenticated for scraping and must be
//! network-restricted at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use ferry_core::ImportKindName;
use ferry_mirror::{ExportOutcome, ImportDetail, ImportOutcome, MirrorResult};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};
use std::time::Duration;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Export metrics
pub static EXPORTS_STARTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ferry_exports_started_total",
            "Exports accepted and handed to a background task",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static EXPORTS_COMMITTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ferry_exports_committed_total",
            "Exports whose archive was published",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static EXPORTS_ABANDONED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ferry_exports_abandoned_total",
            "Signed exports abandoned at a non-fatal stage",
        ),
        &["kind", "stage"],
    )
    .expect("metric creation failed")
});

pub static EXPORTS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("ferry_exports_failed_total", "Exports that ended in an error"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static ACTIVE_EXPORTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "ferry_active_exports",
        "Exports currently streaming in the background",
    )
    .expect("metric creation failed")
});

pub static EXPORT_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "ferry_export_duration_seconds",
            "Time from background start to export completion",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["kind"],
    )
    .expect("metric creation failed")
});

// Import metrics
pub static IMPORTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("ferry_imports_total", "Imports by kind and result"),
        &["kind", "result"],
    )
    .expect("metric creation failed")
});

pub static BLOBS_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_blobs_uploaded_total",
        "Registry blobs uploaded by image imports",
    )
    .expect("metric creation failed")
});

pub static BLOBS_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_blobs_skipped_total",
        "Registry blobs skipped because the registry already had them",
    )
    .expect("metric creation failed")
});

pub static FILES_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ferry_files_skipped_total",
        "File imports skipped because the destination was already complete",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        REGISTRY
            .register(Box::new(EXPORTS_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORTS_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORTS_ABANDONED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORTS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_EXPORTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXPORT_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(IMPORTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOBS_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BLOBS_SKIPPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_SKIPPED.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record how a background export ended.
pub fn record_export(
    kind: ImportKindName,
    result: &MirrorResult<ExportOutcome>,
    elapsed: Duration,
) {
    let kind = kind.as_str();
    EXPORT_DURATION
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
    match result {
        Ok(ExportOutcome::Committed { .. }) => {
            EXPORTS_COMMITTED.with_label_values(&[kind]).inc();
        }
        Ok(ExportOutcome::Abandoned { stage, .. }) => {
            EXPORTS_ABANDONED
                .with_label_values(&[kind, stage.as_str()])
                .inc();
        }
        Err(_) => {
            EXPORTS_FAILED.with_label_values(&[kind]).inc();
        }
    }
}

/// Record a finished import. `kind` is `None` when the envelope could not be read.
pub fn record_import(kind: Option<ImportKindName>, result: &MirrorResult<ImportOutcome>) {
    let kind = kind.map(|k| k.as_str()).unwrap_or("unknown");
    match result {
        Ok(outcome) => {
            IMPORTS.with_label_values(&[kind, "success"]).inc();
            match &outcome.detail {
                ImportDetail::File {
                    already_complete, ..
                } => {
                    if *already_complete {
                        FILES_SKIPPED.inc();
                    }
                }
                ImportDetail::Image {
                    blobs_uploaded,
                    blobs_skipped,
                    ..
                } => {
                    BLOBS_UPLOADED.inc_by(*blobs_uploaded as u64);
                    BLOBS_SKIPPED.inc_by(*blobs_skipped as u64);
                }
            }
        }
        Err(e) if e.is_domain() => {
            IMPORTS.with_label_values(&[kind, "rejected"]).inc();
        }
        Err(_) => {
            IMPORTS.with_label_values(&[kind, "error"]).inc();
        }
    }
}
