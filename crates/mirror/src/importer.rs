//! Importers: route the entries of an inbound archive to storage or the registry.
//!
//! An importer is built from the envelope of one archive, fed every entry
//! exactly once in archive order by [`extract_archive`](crate::tarball::extract_archive),
//! and resolves once. Re-importing the same archive is a no-op: files already
//! marked complete and blobs the registry already holds are drained and skipped.

use crate::context::MirrorContext;
use crate::error::{ErrorContext, InfraExt, MirrorError, MirrorResult, metadata_context};
use crate::tarball::{CodecError, EntryHeader, EntryKind, ExtractHandler};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_core::naming::mirror_file_path;
use ferry_core::{ContentHash, DistributionPackageName, ExportMetadata, ImportKind};
use ferry_registry::{ImageManifest, ImageRepository};
use ferry_storage::{ObjectMetadata, put_reader};
use futures::SinkExt;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

/// Largest manifest we buffer (4 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Chunk size when streaming a blob entry to the registry.
const BLOB_CHUNK_SIZE: usize = 256 * 1024;

/// Chunks in flight between the archive and the registry upload.
const BLOB_CHANNEL_DEPTH: usize = 4;

static MANIFEST_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^manifest\.json$").expect("valid manifest entry pattern"));

static BLOB_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^blobs/sha256/([0-9a-f]{64})$").expect("valid blob entry pattern")
});

/// What an import did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub metadata: ExportMetadata,
    /// Where the artefact came from on the exporting side.
    pub source: String,
    /// Where it now lives on this side.
    pub destination: String,
    pub detail: ImportDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportDetail {
    File {
        size: u64,
        /// The destination was already complete; nothing was written.
        already_complete: bool,
    },
    Image {
        blobs_uploaded: usize,
        blobs_skipped: usize,
        media_type: String,
    },
}

/// Importer selected by the envelope's import kind.
pub enum Importer {
    File(FileImporter),
    Image(ImageImporter),
}

impl Importer {
    pub fn new(ctx: MirrorContext, metadata: ExportMetadata) -> MirrorResult<Self> {
        Ok(match metadata.kind() {
            ImportKind::File { .. } => Self::File(FileImporter::new(ctx, metadata)?),
            ImportKind::Image { .. } => Self::Image(ImageImporter::new(ctx, metadata)?),
        })
    }

    pub fn metadata(&self) -> &ExportMetadata {
        match self {
            Self::File(importer) => &importer.metadata,
            Self::Image(importer) => &importer.metadata,
        }
    }
}

#[async_trait]
impl ExtractHandler for Importer {
    type Output = ImportOutcome;
    type Error = MirrorError;

    async fn on_entry(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        match self {
            Self::File(importer) => importer.process_entry(header, entry).await,
            Self::Image(importer) => importer.process_entry(header, entry).await,
        }
    }

    fn on_error(&mut self, err: CodecError) -> MirrorError {
        wrap_codec_error(self.metadata(), err)
    }

    async fn on_finish(&mut self) -> MirrorResult<ImportOutcome> {
        match self {
            Self::File(importer) => importer.finish(),
            Self::Image(importer) => importer.finish().await,
        }
    }
}

/// Codec failures are never domain errors; wrap them once with the import context.
fn wrap_codec_error(metadata: &ExportMetadata, err: CodecError) -> MirrorError {
    let context = metadata_context(metadata);
    warn!(export_id = %metadata.export_id, error = %err, "Archive extraction failed");
    MirrorError::infra("archive extraction failed", context, err)
}

fn kind_mismatch(metadata: &ExportMetadata, expected: &str) -> MirrorError {
    MirrorError::internal(
        format!(
            "{expected} importer cannot accept bundle of kind {}",
            metadata.kind_name()
        ),
        metadata_context(metadata),
    )
}

// =============================================================================
// File
// =============================================================================

/// Imports a bundle holding exactly one file.
pub struct FileImporter {
    ctx: MirrorContext,
    metadata: ExportMetadata,
    context: ErrorContext,
    file_path: String,
    destination: String,
    /// Size of the file entry and whether it was already complete.
    imported: Option<(u64, bool)>,
}

impl FileImporter {
    pub fn new(ctx: MirrorContext, metadata: ExportMetadata) -> MirrorResult<Self> {
        let ImportKind::File { file_path } = metadata.kind() else {
            return Err(kind_mismatch(&metadata, "File"));
        };
        let file_path = file_path.clone();
        let destination = mirror_file_path(&metadata.mirrored_model_id, &file_path);
        let mut context = metadata_context(&metadata);
        context.insert("destination".to_string(), destination.clone());
        Ok(Self {
            ctx,
            metadata,
            context,
            file_path,
            destination,
            imported: None,
        })
    }

    /// Object key the file is written to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    async fn process_entry(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        if header.kind != EntryKind::File {
            debug!(entry = %header.name, "Skipping non-file entry");
            return Ok(());
        }
        if self.imported.is_some() {
            return Err(MirrorError::internal(
                "multiple files found in archive",
                self.context.clone(),
            ));
        }

        let records = &self.ctx.records;
        if records
            .is_path_complete(&self.destination)
            .await
            .infra("failed to check destination record", &self.context)?
        {
            info!(destination = %self.destination, "File already imported; skipping");
            self.imported = Some((header.size, true));
            return Ok(());
        }

        let size = put_reader(
            self.ctx.storage.files.as_ref(),
            &self.destination,
            &ObjectMetadata::new(),
            entry,
        )
        .await
        .infra("failed to store imported file", &self.context)?;
        records
            .mark_file_complete(&self.destination, &self.metadata.mirrored_model_id, size)
            .await
            .infra("failed to mark imported file complete", &self.context)?;

        info!(destination = %self.destination, size, "File imported");
        self.imported = Some((size, false));
        Ok(())
    }

    fn finish(&mut self) -> MirrorResult<ImportOutcome> {
        let (size, already_complete) = self.imported.ok_or_else(|| {
            MirrorError::internal("no file found in archive", self.context.clone())
        })?;
        Ok(ImportOutcome {
            metadata: self.metadata.clone(),
            source: self.file_path.clone(),
            destination: self.destination.clone(),
            detail: ImportDetail::File {
                size,
                already_complete,
            },
        })
    }
}

// =============================================================================
// Image
// =============================================================================

/// Image import phases. Blobs are written while `Collecting`; the buffered
/// manifest is pushed once, in `Committing`, after the archive has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageImportState {
    Collecting,
    Committing,
    Done,
    Failed,
}

/// Imports a bundle of `manifest.json` plus `blobs/sha256/<hex>` entries.
pub struct ImageImporter {
    metadata: ExportMetadata,
    context: ErrorContext,
    package_name: DistributionPackageName,
    image_name: String,
    repo: Arc<dyn ImageRepository>,
    state: ImageImportState,
    manifest: Option<Bytes>,
    /// Digests uploaded or found present during this import.
    seen: HashSet<ContentHash>,
    uploaded: usize,
    skipped: usize,
}

impl ImageImporter {
    pub fn new(ctx: MirrorContext, metadata: ExportMetadata) -> MirrorResult<Self> {
        let ImportKind::Image {
            distribution_package_name,
        } = metadata.kind()
        else {
            return Err(kind_mismatch(&metadata, "Image"));
        };
        let package_name = distribution_package_name.clone();
        let mut context = metadata_context(&metadata);
        context.insert(
            "distributionPackageName".to_string(),
            package_name.to_string(),
        );

        let image_name = package_name
            .image_name_under(&metadata.mirrored_model_id)
            .ok_or_else(|| {
                MirrorError::bad_request(
                    format!(
                        "image {} is not under mirrored model {}",
                        package_name, metadata.mirrored_model_id
                    ),
                    context.clone(),
                )
            })?
            .to_string();
        let repo = ctx
            .registry
            .repository(&metadata.mirrored_model_id, &image_name);

        Ok(Self {
            metadata,
            context,
            package_name,
            image_name,
            repo,
            state: ImageImportState::Collecting,
            manifest: None,
            seen: HashSet::new(),
            uploaded: 0,
            skipped: 0,
        })
    }

    pub fn state(&self) -> ImageImportState {
        self.state
    }

    async fn process_entry(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        if self.state != ImageImportState::Collecting {
            return Err(MirrorError::internal(
                format!("entry received in state {:?}", self.state),
                self.context.clone(),
            ));
        }
        let result = self.collect(header, entry).await;
        if result.is_err() {
            self.state = ImageImportState::Failed;
        }
        result
    }

    async fn collect(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        if header.kind != EntryKind::File {
            debug!(entry = %header.name, "Skipping non-file entry");
            return Ok(());
        }

        if MANIFEST_ENTRY.is_match(&header.name) {
            return self.buffer_manifest(header, entry).await;
        }

        let Some(hex) = BLOB_ENTRY
            .captures(&header.name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
        else {
            warn!(entry = %header.name, "Skipping unrecognized archive entry");
            return Ok(());
        };
        let digest = ContentHash::from_hex(hex)
            .map_err(|e| MirrorError::internal(e.to_string(), self.context.clone()))?;

        if self.seen.contains(&digest) {
            debug!(digest = %digest, "Blob repeated in archive; skipping");
            return Ok(());
        }
        if self
            .repo
            .blob_exists(&digest)
            .await
            .infra("failed to probe blob", &self.context)?
        {
            debug!(digest = %digest, "Blob already present; skipping");
            self.seen.insert(digest);
            self.skipped += 1;
            return Ok(());
        }

        self.upload_blob(&digest, header.size, entry).await?;
        self.seen.insert(digest);
        self.uploaded += 1;
        Ok(())
    }

    async fn buffer_manifest(
        &mut self,
        header: &EntryHeader,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        if self.manifest.is_some() {
            return Err(MirrorError::internal(
                "multiple manifests found in archive",
                self.context.clone(),
            ));
        }
        if header.size > MAX_MANIFEST_SIZE {
            return Err(MirrorError::internal(
                format!(
                    "manifest of {} bytes exceeds the {MAX_MANIFEST_SIZE} byte limit",
                    header.size
                ),
                self.context.clone(),
            ));
        }
        let mut body = Vec::with_capacity(header.size as usize);
        entry
            .read_to_end(&mut body)
            .await
            .infra("failed to read manifest entry", &self.context)?;
        debug!(bytes = body.len(), "Buffered manifest");
        self.manifest = Some(Bytes::from(body));
        Ok(())
    }

    /// Stream one blob entry into a new upload session. Returns once the
    /// registry has committed the blob, so the next entry starts only after.
    async fn upload_blob(
        &self,
        digest: &ContentHash,
        size: u64,
        entry: &mut (dyn AsyncRead + Send + Unpin),
    ) -> MirrorResult<()> {
        let session = self
            .repo
            .initiate_upload()
            .await
            .infra("failed to open blob upload", &self.context)?;

        let (mut tx, rx) =
            futures::channel::mpsc::channel::<std::io::Result<Bytes>>(BLOB_CHANNEL_DEPTH);
        let upload = self
            .repo
            .put_blob(&session, digest, Box::pin(rx), Some(size));
        let feed = async move {
            loop {
                let mut chunk = BytesMut::with_capacity(BLOB_CHUNK_SIZE);
                match entry.read_buf(&mut chunk).await {
                    Ok(0) => return Ok(()),
                    Ok(_) => {
                        // A closed channel means the upload already ended; its
                        // own result says why.
                        if tx.send(Ok(chunk.freeze())).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        let relay = std::io::Error::new(e.kind(), e.to_string());
                        let _ = tx.send(Err(relay)).await;
                        return Err(e);
                    }
                }
            }
        };

        let (uploaded, fed) = tokio::join!(upload, feed);
        fed.infra("failed to read blob entry", &self.context)?;
        uploaded.infra("failed to upload blob", &self.context)?;
        debug!(digest = %digest, size, "Blob uploaded");
        Ok(())
    }

    async fn finish(&mut self) -> MirrorResult<ImportOutcome> {
        if self.state != ImageImportState::Collecting {
            return Err(MirrorError::internal(
                format!("finish called in state {:?}", self.state),
                self.context.clone(),
            ));
        }
        self.state = ImageImportState::Committing;
        let result = self.commit().await;
        self.state = match result {
            Ok(_) => ImageImportState::Done,
            Err(_) => ImageImportState::Failed,
        };
        result
    }

    async fn commit(&mut self) -> MirrorResult<ImportOutcome> {
        let body = self.manifest.take().ok_or_else(|| {
            MirrorError::internal("no manifest found in archive", self.context.clone())
        })?;
        let manifest = ImageManifest::parse(&body).map_err(|e| {
            MirrorError::internal(format!("malformed manifest: {e}"), self.context.clone())
        })?;
        let media_type = manifest.accepted_media_type().ok_or_else(|| {
            MirrorError::internal(
                "manifest lacks a recognizable media type",
                self.context.clone(),
            )
        })?;

        // Every referenced blob must be in the registry before the manifest is.
        let referenced = manifest
            .blob_digests()
            .map_err(|e| MirrorError::internal(e.to_string(), self.context.clone()))?;
        for digest in &referenced {
            if self.seen.contains(digest) {
                continue;
            }
            if !self
                .repo
                .blob_exists(digest)
                .await
                .infra("failed to probe blob", &self.context)?
            {
                let mut context = self.context.clone();
                context.insert("digest".to_string(), digest.to_digest());
                return Err(MirrorError::internal(
                    "manifest references a blob missing from the registry",
                    context,
                ));
            }
        }

        let tag = self.package_name.tag().to_string();
        self.repo
            .put_manifest(&tag, body, media_type)
            .await
            .infra("failed to push manifest", &self.context)?;

        info!(
            repository = %self.repo.name(),
            tag = %tag,
            blobs_uploaded = self.uploaded,
            blobs_skipped = self.skipped,
            "Image imported"
        );
        Ok(ImportOutcome {
            metadata: self.metadata.clone(),
            source: format!(
                "{}/{}:{tag}",
                self.metadata.source_model_id, self.image_name
            ),
            destination: self.package_name.to_string(),
            detail: ImportDetail::Image {
                blobs_uploaded: self.uploaded,
                blobs_skipped: self.skipped,
                media_type: media_type.to_string(),
            },
        })
    }
}
