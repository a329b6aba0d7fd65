//! Core domain types shared by the ferry mirroring workspace.
//!
//! This crate defines the data model every other crate speaks:
//! - Content digests
//! - The export metadata envelope and its import kinds
//! - Distribution package names
//! - Object keys and archive entry naming
//! - Application configuration

pub mod config;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod naming;
pub mod package;

pub use envelope::{ExportMetadata, ExportSignature, ImportKind, ImportKindName};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use package::DistributionPackageName;

/// Version of the envelope written by this build. Imports of other versions are refused.
pub const EXPORT_SCHEMA_VERSION: u32 = 1;

/// Default buffer between the archive writer and the gzip output: 16 MiB
pub const DEFAULT_GZIP_CHUNK_SIZE: usize = 16 * 1024 * 1024;
