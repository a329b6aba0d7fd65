//! Registry client error types.

use thiserror::Error;

/// Registry client errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered with a non-2xx status.
    #[error("registry returned {status} for {method} {url}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("upload session response had no usable Location header")]
    MissingLocation,

    #[error("credential error: {0}")]
    Credentials(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

impl RegistryError {
    /// HTTP status if the registry answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
