//! Pipeline error taxonomy.
//!
//! Domain errors (`Forbidden`, `BadRequest`, `NotFound`, `Internal`) carry the
//! classification decided where they were raised and are never re-wrapped.
//! Everything else is an infrastructure failure, wrapped exactly once into
//! `Infra` with the export/import context attached.

use ferry_core::ExportMetadata;
use std::collections::BTreeMap;
use thiserror::Error;

/// Structured context attached to an error (export id, kind, model ids, ...).
pub type ErrorContext = BTreeMap<String, String>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// Authorization denied. Fatal, raised before any streaming.
    #[error("forbidden: {message}")]
    Forbidden {
        message: String,
        context: ErrorContext,
    },

    /// Validation failed. Fatal, raised before any streaming.
    #[error("bad request: {message}")]
    BadRequest {
        message: String,
        context: ErrorContext,
    },

    /// A referenced record does not exist.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        context: ErrorContext,
    },

    /// A precondition the pipeline itself should have upheld.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        context: ErrorContext,
    },

    /// Storage, network or compression failure.
    #[error("{message}: {source}")]
    Infra {
        message: String,
        context: ErrorContext,
        #[source]
        source: BoxError,
    },
}

impl MirrorError {
    pub fn forbidden(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Forbidden {
            message: message.into(),
            context,
        }
    }

    pub fn bad_request(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::BadRequest {
            message: message.into(),
            context,
        }
    }

    pub fn not_found(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::NotFound {
            message: message.into(),
            context,
        }
    }

    pub fn internal(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Internal {
            message: message.into(),
            context,
        }
    }

    pub fn infra(
        message: impl Into<String>,
        context: ErrorContext,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Infra {
            message: message.into(),
            context,
            source: source.into(),
        }
    }

    /// True for errors classified where they were raised.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::Infra { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Forbidden { message, .. }
            | Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Internal { message, .. }
            | Self::Infra { message, .. } => message,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Forbidden { context, .. }
            | Self::BadRequest { context, .. }
            | Self::NotFound { context, .. }
            | Self::Internal { context, .. }
            | Self::Infra { context, .. } => context,
        }
    }
}

/// Result type for pipeline operations.
pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

/// Wrap non-pipeline errors into `Infra`.
pub(crate) trait InfraExt<T> {
    fn infra(self, message: &str, context: &ErrorContext) -> MirrorResult<T>;
}

impl<T, E> InfraExt<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn infra(self, message: &str, context: &ErrorContext) -> MirrorResult<T> {
        self.map_err(|e| MirrorError::infra(message, context.clone(), e))
    }
}

/// Context identifying one export or import in errors and logs.
pub fn metadata_context(metadata: &ExportMetadata) -> ErrorContext {
    let mut context = ErrorContext::new();
    context.insert("exportId".to_string(), metadata.export_id.clone());
    context.insert("importKind".to_string(), metadata.kind_name().to_string());
    context.insert(
        "sourceModelId".to_string(),
        metadata.source_model_id.clone(),
    );
    context.insert(
        "mirroredModelId".to_string(),
        metadata.mirrored_model_id.clone(),
    );
    context
}
