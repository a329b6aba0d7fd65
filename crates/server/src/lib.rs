//! HTTP API for requesting artefact exports and imports.
//!
//! This crate provides the control plane in front of the mirror pipeline:
//! - File and image export requests, streamed in the background
//! - Export status lookup
//! - Import of published archives
//! - Signing key discovery
//! - Prometheus metrics

pub mod auth;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use auth::{Principal, TraceId};
pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, ExportState, ExportStatus, ExportTracker};
