//! The ferry mirror pipeline.
//!
//! This crate provides:
//! - A streaming tar/gzip codec with a pull-based, one-entry-at-a-time reader
//! - Exporters that resolve, authorize and validate an artefact, then stream it
//!   into an archive
//! - Importers that route archive entries to object storage or a registry
//! - The coordinator that publishes archives (optionally signed) and imports them

pub mod context;
pub mod coordinator;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod tarball;

pub use context::MirrorContext;
pub use coordinator::{Coordinator, ExportOutcome, ExportStage, PreparedExport};
pub use error::{ErrorContext, MirrorError, MirrorResult, metadata_context};
pub use exporter::{BundleParams, ExportTarget, Exporter, ExporterState};
pub use importer::{
    FileImporter, ImageImportState, ImageImporter, ImportDetail, ImportOutcome, Importer,
    MAX_MANIFEST_SIZE,
};
pub use tarball::{
    ArchiveEntry, ArchiveReader, ArchiveWriter, CodecError, CodecResult, EntryHeader, EntryKind,
    ExtractHandler, create_extract_streams, create_pack_streams, extract_archive, pipe_entry,
};
