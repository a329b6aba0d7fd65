//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid distribution package name: {0}")]
    InvalidPackageName(String),

    #[error("distribution package name has no tag: {0}")]
    MissingTag(String),

    #[error("invalid export metadata: {0}")]
    InvalidMetadata(String),

    #[error("missing export metadata field: {0}")]
    MissingMetadataField(&'static str),

    #[error("unsupported export schema version: {0}")]
    UnsupportedSchemaVersion(u32),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
