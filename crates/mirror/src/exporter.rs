//! Exporters: authorize, validate and stream one artefact into an archive.
//!
//! One `Exporter` serves one export request and is then discarded:
//!
//! ```text
//! Uninitialized --init--> Initialized --add_data--> Streaming --> Complete
//!        \                      \                        \
//!         `-------------------------------------------------> Failed
//! ```
//!
//! The artefact kinds form a closed set, so the kind-specific steps are plain
//! functions selected by matching on [`ExportTarget`].

use crate::context::MirrorContext;
use crate::error::{ErrorContext, InfraExt, MirrorError, MirrorResult};
use crate::tarball::{ArchiveWriter, pipe_entry};
use ferry_core::naming::{MANIFEST_ENTRY, archive_file_name, blob_entry_name};
use ferry_core::{
    ContentHash, DistributionPackageName, ExportMetadata, ImportKind, ImportKindName,
};
use ferry_metadata::{Action, FileRecord, ImageRef, ModelRecord, ScanState};
use ferry_storage::get_reader;
use std::collections::HashSet;
use tokio::io::AsyncWrite;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

/// What to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    File {
        model_id: String,
        file_id: String,
    },
    Image {
        model_id: String,
        release: String,
        image_name: String,
        tag: String,
    },
}

impl ExportTarget {
    pub fn model_id(&self) -> &str {
        match self {
            Self::File { model_id, .. } | Self::Image { model_id, .. } => model_id,
        }
    }

    pub fn kind(&self) -> ImportKindName {
        match self {
            Self::File { .. } => ImportKindName::File,
            Self::Image { .. } => ImportKindName::Image,
        }
    }
}

/// Exporter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterState {
    Uninitialized,
    Initialized,
    Streaming,
    Complete,
    Failed,
}

/// Where the archive goes and what describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleParams {
    /// File id or image name.
    pub artefact_id: String,
    /// `<artefactId>.tar.gz`
    pub archive_name: String,
    pub metadata: ExportMetadata,
}

/// Resolved state from `init`.
#[derive(Debug, Clone)]
enum Prepared {
    File {
        file: FileRecord,
        metadata: ExportMetadata,
    },
    Image {
        image: ImageRef,
        metadata: ExportMetadata,
    },
}

impl Prepared {
    fn metadata(&self) -> &ExportMetadata {
        match self {
            Self::File { metadata, .. } | Self::Image { metadata, .. } => metadata,
        }
    }
}

/// Single-use exporter for one artefact.
pub struct Exporter {
    ctx: MirrorContext,
    user: String,
    export_id: String,
    target: ExportTarget,
    state: ExporterState,
    prepared: Option<Prepared>,
}

impl Exporter {
    /// Create an exporter acting as `user`, with a fresh export id.
    pub fn new(ctx: MirrorContext, user: impl Into<String>, target: ExportTarget) -> Self {
        Self {
            ctx,
            user: user.into(),
            export_id: uuid::Uuid::new_v4().to_string(),
            target,
            state: ExporterState::Uninitialized,
            prepared: None,
        }
    }

    pub fn with_export_id(mut self, export_id: impl Into<String>) -> Self {
        self.export_id = export_id.into();
        self
    }

    pub fn state(&self) -> ExporterState {
        self.state
    }

    pub fn export_id(&self) -> &str {
        &self.export_id
    }

    pub fn target(&self) -> &ExportTarget {
        &self.target
    }

    fn context(&self) -> ErrorContext {
        let mut context = ErrorContext::new();
        context.insert("exportId".to_string(), self.export_id.clone());
        context.insert("user".to_string(), self.user.clone());
        context.insert("modelId".to_string(), self.target.model_id().to_string());
        context.insert("importKind".to_string(), self.target.kind().to_string());
        context
    }

    /// Resolve, authorize and validate the target. Nothing is written.
    pub async fn init(&mut self) -> MirrorResult<()> {
        if self.state != ExporterState::Uninitialized {
            return Err(MirrorError::internal(
                "exporter initialized twice",
                self.context(),
            ));
        }

        let result = match self.target.clone() {
            ExportTarget::File { model_id, file_id } => self.init_file(&model_id, &file_id).await,
            ExportTarget::Image {
                model_id,
                release,
                image_name,
                tag,
            } => {
                self.init_image(&model_id, &release, &image_name, &tag)
                    .await
            }
        };

        match result {
            Ok(prepared) => {
                info!(
                    export_id = %self.export_id,
                    import_kind = %self.target.kind(),
                    mirrored_model_id = %prepared.metadata().mirrored_model_id,
                    "Export initialized"
                );
                self.prepared = Some(prepared);
                self.state = ExporterState::Initialized;
                Ok(())
            }
            Err(e) => {
                self.state = ExporterState::Failed;
                Err(e)
            }
        }
    }

    /// Archive name and envelope. Only valid after `init`.
    pub fn get_bundle_metadata_params(&self) -> MirrorResult<BundleParams> {
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            MirrorError::internal("bundle metadata requested before init", self.context())
        })?;
        let artefact_id = match prepared {
            Prepared::File { file, .. } => file.id.clone(),
            Prepared::Image { image, .. } => image.name.clone(),
        };
        Ok(BundleParams {
            archive_name: archive_file_name(&artefact_id),
            artefact_id,
            metadata: prepared.metadata().clone(),
        })
    }

    /// Stream the artefact's entries into `writer`. The caller closes the writer.
    pub async fn add_data<W>(&mut self, writer: &mut ArchiveWriter<W>) -> MirrorResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let prepared = match (&self.state, &self.prepared) {
            (ExporterState::Initialized, Some(prepared)) => prepared.clone(),
            _ => {
                return Err(MirrorError::internal(
                    format!("add_data called in state {:?}", self.state),
                    self.context(),
                ));
            }
        };
        self.state = ExporterState::Streaming;

        let context = self.context();
        let result = match &prepared {
            Prepared::File { file, .. } => add_file_data(&self.ctx, file, writer, &context).await,
            Prepared::Image { image, .. } => {
                add_image_data(&self.ctx, image, writer, &context).await
            }
        };
        if result.is_err() {
            self.state = ExporterState::Failed;
        }
        result
    }

    /// Record that the archive reached its destination.
    pub(crate) fn mark_complete(&mut self) {
        self.state = ExporterState::Complete;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = ExporterState::Failed;
    }

    // -------------------------------------------------------------------------
    // init strategies
    // -------------------------------------------------------------------------

    async fn load_model(&self, model_id: &str) -> MirrorResult<ModelRecord> {
        let context = self.context();
        self.ctx
            .records
            .get_model(model_id)
            .await
            .infra("failed to load model", &context)?
            .ok_or_else(|| MirrorError::not_found(format!("model {model_id} not found"), context))
    }

    async fn authorize(
        &self,
        model: &ModelRecord,
        action: Action,
        target: &str,
    ) -> MirrorResult<()> {
        let context = self.context();
        let decision = self
            .ctx
            .authorizer
            .authorize(&self.user, model, action, target)
            .await
            .infra("authorization check failed", &context)?;
        if decision.success {
            return Ok(());
        }
        let mut context = context;
        context.extend(decision.info);
        Err(MirrorError::forbidden(
            format!("{} may not {action} on model {}", self.user, model.id),
            context,
        ))
    }

    fn mirrored_model_id(&self, model: &ModelRecord) -> MirrorResult<String> {
        model
            .mirror
            .destination_model_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                MirrorError::bad_request(
                    format!("model {} has no mirror destination configured", model.id),
                    self.context(),
                )
            })
    }

    async fn init_file(&self, model_id: &str, file_id: &str) -> MirrorResult<Prepared> {
        let context = self.context();
        let model = self.load_model(model_id).await?;
        let file = self
            .ctx
            .records
            .get_file(file_id)
            .await
            .infra("failed to load file", &context)?
            .filter(|f| f.model_id == model_id)
            .ok_or_else(|| {
                MirrorError::not_found(
                    format!("file {file_id} not found in model {model_id}"),
                    context.clone(),
                )
            })?;

        self.authorize(&model, Action::ExportFile, file_id).await?;
        self.validate_file(&file)?;

        let metadata = ExportMetadata::new(
            model_id,
            self.mirrored_model_id(&model)?,
            &self.user,
            &self.export_id,
            ImportKind::File {
                file_path: file.path.clone(),
            },
        );
        Ok(Prepared::File { file, metadata })
    }

    fn validate_file(&self, file: &FileRecord) -> MirrorResult<()> {
        let mut context = self.context();
        context.insert("fileId".to_string(), file.id.clone());

        let max = self.ctx.config.export_max_size;
        if file.size > max {
            context.insert("size".to_string(), file.size.to_string());
            context.insert("maxSize".to_string(), max.to_string());
            return Err(MirrorError::bad_request(
                format!("file is larger than the maximum export size of {max} bytes"),
                context,
            ));
        }

        if !self.ctx.config.scanning_enabled {
            return Ok(());
        }
        if file.scan_results.is_empty() {
            return Err(MirrorError::bad_request(
                "file has not been scanned",
                context,
            ));
        }
        if let Some(pending) = file
            .scan_results
            .iter()
            .find(|r| r.state != ScanState::Complete)
        {
            context.insert("tool".to_string(), pending.tool.clone());
            return Err(MirrorError::bad_request(
                "file scanning is not complete",
                context,
            ));
        }
        if let Some(infected) = file
            .scan_results
            .iter()
            .find(|r| r.is_infected == Some(true))
        {
            context.insert("tool".to_string(), infected.tool.clone());
            return Err(MirrorError::bad_request(
                "file failed its malware scan",
                context,
            ));
        }
        Ok(())
    }

    async fn init_image(
        &self,
        model_id: &str,
        semver: &str,
        image_name: &str,
        tag: &str,
    ) -> MirrorResult<Prepared> {
        let context = self.context();
        let model = self.load_model(model_id).await?;
        let release = self
            .ctx
            .records
            .get_release(model_id, semver)
            .await
            .infra("failed to load release", &context)?
            .ok_or_else(|| {
                MirrorError::not_found(
                    format!("release {semver} not found in model {model_id}"),
                    context.clone(),
                )
            })?;
        let image = release
            .find_image(image_name, tag)
            .cloned()
            .ok_or_else(|| {
                MirrorError::internal(
                    format!("release {semver} does not reference image {image_name}:{tag}"),
                    context.clone(),
                )
            })?;

        // Registry access is repository-scoped, so pull access is checked on the model.
        self.authorize(&model, Action::PullImage, model_id).await?;

        let mirrored_model_id = self.mirrored_model_id(&model)?;
        let package_name = DistributionPackageName::new(
            self.ctx.registry_domain.clone(),
            format!("{}/{}", image.repository, image.name),
            image.tag.clone(),
        )
        .and_then(|name| name.rewrite_model_prefix(model_id, &mirrored_model_id))
        .map_err(|e| MirrorError::bad_request(e.to_string(), context.clone()))?;

        let metadata = ExportMetadata::new(
            model_id,
            mirrored_model_id,
            &self.user,
            &self.export_id,
            ImportKind::Image {
                distribution_package_name: package_name,
            },
        );
        Ok(Prepared::Image { image, metadata })
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("export_id", &self.export_id)
            .field("user", &self.user)
            .field("target", &self.target)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// add_data strategies
// -----------------------------------------------------------------------------

async fn add_file_data<W>(
    ctx: &MirrorContext,
    file: &FileRecord,
    writer: &mut ArchiveWriter<W>,
    context: &ErrorContext,
) -> MirrorResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = get_reader(ctx.storage.files.as_ref(), &file.path)
        .await
        .infra("failed to open file for export", context)?;
    pipe_entry(writer, &file.id, file.size, &mut reader, &file.path)
        .await
        .infra("failed to write file into archive", context)?;
    debug!(file_id = %file.id, size = file.size, "File streamed into archive");
    Ok(())
}

async fn add_image_data<W>(
    ctx: &MirrorContext,
    image: &ImageRef,
    writer: &mut ArchiveWriter<W>,
    context: &ErrorContext,
) -> MirrorResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let repo = ctx.registry.repository(&image.repository, &image.name);
    let fetched = repo
        .get_manifest(&image.tag)
        .await
        .infra("failed to fetch image manifest", context)?;
    let manifest = fetched.parse().map_err(|e| {
        MirrorError::internal(format!("malformed image manifest: {e}"), context.clone())
    })?;
    if manifest.accepted_media_type().is_none() {
        return Err(MirrorError::internal(
            format!(
                "unsupported manifest media type {:?}",
                manifest.media_type.as_deref().unwrap_or_default()
            ),
            context.clone(),
        ));
    }

    // Blobs go first so an importer sees them before the manifest.
    let mut written = HashSet::new();
    for descriptor in manifest.config.iter().chain(manifest.layers.iter()) {
        let digest = ContentHash::from_digest(&descriptor.digest).map_err(|e| {
            MirrorError::internal(format!("malformed blob digest: {e}"), context.clone())
        })?;
        if !written.insert(digest) {
            continue;
        }
        let (stream, _) = repo
            .get_blob(&digest)
            .await
            .infra("failed to fetch blob", context)?;
        let mut reader = StreamReader::new(stream);
        pipe_entry(
            writer,
            &blob_entry_name(&digest.to_hex()),
            descriptor.size,
            &mut reader,
            repo.name(),
        )
        .await
        .infra("failed to write blob into archive", context)?;
    }

    writer
        .append_bytes(MANIFEST_ENTRY, &fetched.body)
        .await
        .infra("failed to write manifest into archive", context)?;
    debug!(
        repository = %repo.name(),
        blobs = written.len(),
        "Image streamed into archive"
    );
    Ok(())
}
