//! Export and import orchestration.
//!
//! Exports stream an archive straight to the exports bucket, or, when a signer
//! is configured, through the staging bucket so the digest of the complete
//! archive can be signed before publishing:
//!
//! ```text
//! Stage  -> write archive to staging          (failure: logged, abandoned)
//! Digest -> re-read staging, SHA-256          (failure: logged, abandoned)
//! Sign   -> sign the digest                   (fatal)
//! Commit -> copy to exports with signature    (fatal)
//! ```
//!
//! Nothing is visible under the export key unless the final write completes.

use crate::context::MirrorContext;
use crate::error::{ErrorContext, InfraExt, MirrorError, MirrorResult, metadata_context};
use crate::exporter::{BundleParams, ExportTarget, Exporter};
use crate::importer::{ImportOutcome, Importer};
use crate::tarball::{create_pack_streams, extract_archive};
use ferry_core::ExportMetadata;
use ferry_core::naming::export_key;
use ferry_signer::digest_reader;
use ferry_storage::io::pump_into;
use ferry_storage::{ObjectMetadata, ObjectStore, StorageError, get_reader, put_reader};
use serde::Serialize;
use std::fmt;
use tokio::io::AsyncRead;
use tracing::{Instrument, error, info, info_span, warn};

/// Steps of a signed export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportStage {
    Stage,
    Digest,
    Sign,
    Commit,
}

impl ExportStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Digest => "digest",
            Self::Sign => "sign",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for ExportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an export ended when no error escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// The archive is published under `key`.
    Committed {
        key: String,
        metadata: ExportMetadata,
        size: u64,
    },
    /// A non-fatal stage failed; nothing was published.
    Abandoned { stage: ExportStage, reason: String },
}

impl ExportOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// An initialized exporter with its resolved destination.
pub struct PreparedExport {
    exporter: Exporter,
    params: BundleParams,
    key: String,
}

impl PreparedExport {
    pub fn export_id(&self) -> &str {
        self.exporter.export_id()
    }

    /// Object key in the exports bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn params(&self) -> &BundleParams {
        &self.params
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }
}

/// Runs exports and imports against one [`MirrorContext`].
#[derive(Clone, Debug)]
pub struct Coordinator {
    ctx: MirrorContext,
}

impl Coordinator {
    pub fn new(ctx: MirrorContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &MirrorContext {
        &self.ctx
    }

    /// Initialize an exporter for `target`. Authorization and validation
    /// failures surface here, before any archive exists.
    pub async fn prepare_export(
        &self,
        user: &str,
        target: ExportTarget,
    ) -> MirrorResult<PreparedExport> {
        let mut exporter = Exporter::new(self.ctx.clone(), user, target);
        exporter.init().await?;
        let params = exporter.get_bundle_metadata_params()?;
        let key = export_key(exporter.export_id(), &params.artefact_id);
        Ok(PreparedExport {
            exporter,
            params,
            key,
        })
    }

    /// Prepare and run an export in one call.
    pub async fn export(&self, user: &str, target: ExportTarget) -> MirrorResult<ExportOutcome> {
        let mut prepared = self.prepare_export(user, target).await?;
        self.run_export(&mut prepared).await
    }

    /// Stream the archive to its destination. The exporter ends `Complete`
    /// when the archive was committed and `Failed` otherwise.
    pub async fn run_export(&self, prepared: &mut PreparedExport) -> MirrorResult<ExportOutcome> {
        let metadata = prepared.params.metadata.clone();
        let span = info_span!(
            "export",
            export_id = %metadata.export_id,
            import_kind = %metadata.kind_name(),
        );

        let result = async {
            let key = prepared.key.clone();
            match self.ctx.signer.clone() {
                None => self
                    .export_unsigned(&mut prepared.exporter, &key, metadata)
                    .await,
                Some(signer) => {
                    self.export_signed(&mut prepared.exporter, &key, metadata, signer.as_ref())
                        .await
                }
            }
        }
        .instrument(span.clone())
        .await;

        let _enter = span.enter();
        match &result {
            Ok(ExportOutcome::Committed { key, size, .. }) => {
                prepared.exporter.mark_complete();
                info!(key = %key, size, "Export committed");
            }
            Ok(ExportOutcome::Abandoned { stage, reason }) => {
                prepared.exporter.mark_failed();
                warn!(stage = %stage, reason = %reason, "Export abandoned");
            }
            Err(e) => {
                prepared.exporter.mark_failed();
                error!(error = %e, "Export failed");
            }
        }
        result
    }

    async fn export_unsigned(
        &self,
        exporter: &mut Exporter,
        key: &str,
        metadata: ExportMetadata,
    ) -> MirrorResult<ExportOutcome> {
        let size = self
            .write_archive(
                exporter,
                self.ctx.storage.exports.as_ref(),
                key,
                &metadata.to_object_metadata(),
                &metadata_context(&metadata),
            )
            .await?;
        Ok(ExportOutcome::Committed {
            key: key.to_string(),
            metadata,
            size,
        })
    }

    async fn export_signed(
        &self,
        exporter: &mut Exporter,
        key: &str,
        metadata: ExportMetadata,
        signer: &dyn ferry_signer::Signer,
    ) -> MirrorResult<ExportOutcome> {
        let context = metadata_context(&metadata);
        let staging = self.ctx.storage.staging.as_ref();

        // Stage
        if let Err(e) = self
            .write_archive(exporter, staging, key, &ObjectMetadata::new(), &context)
            .await
        {
            if e.is_domain() {
                return Err(e);
            }
            error!(stage = %ExportStage::Stage, key = %key, error = %e, "Staging write failed");
            return Ok(ExportOutcome::Abandoned {
                stage: ExportStage::Stage,
                reason: e.to_string(),
            });
        }

        // Digest
        let digest = match self.digest_staged(staging, key).await {
            Ok(digest) => digest,
            Err(e) => {
                error!(stage = %ExportStage::Digest, key = %key, error = %e, "Staging read failed");
                discard_staged(staging, key).await;
                return Ok(ExportOutcome::Abandoned {
                    stage: ExportStage::Digest,
                    reason: e.to_string(),
                });
            }
        };

        // Sign
        let signature = signer.sign(&digest);
        let metadata = metadata.with_signature(signature.into());

        // Commit
        let committed = async {
            let mut reader = get_reader(staging, key).await?;
            put_reader(
                self.ctx.storage.exports.as_ref(),
                key,
                &metadata.to_object_metadata(),
                &mut reader,
            )
            .await
        }
        .await;
        discard_staged(staging, key).await;
        let size = committed.infra("failed to publish signed archive", &context)?;

        info!(digest = %digest, key_name = %signer.key_name(), "Archive signed");
        Ok(ExportOutcome::Committed {
            key: key.to_string(),
            metadata,
            size,
        })
    }

    async fn digest_staged(
        &self,
        staging: &dyn ObjectStore,
        key: &str,
    ) -> Result<ferry_core::ContentHash, Box<dyn std::error::Error + Send + Sync>> {
        let mut reader = get_reader(staging, key).await?;
        Ok(digest_reader(&mut reader).await?)
    }

    /// Build the archive and stream it into `store` under `key`. The upload is
    /// finished only if the archive closed cleanly; otherwise it is aborted.
    async fn write_archive(
        &self,
        exporter: &mut Exporter,
        store: &dyn ObjectStore,
        key: &str,
        object_metadata: &ObjectMetadata,
        context: &ErrorContext,
    ) -> MirrorResult<u64> {
        let mut upload = store
            .put_stream(key, object_metadata)
            .await
            .infra("failed to open archive upload", context)?;
        let (mut writer, mut output) = create_pack_streams(self.ctx.config.gzip_chunk_size);

        let produce = async move {
            match exporter.add_data(&mut writer).await {
                Ok(()) => writer
                    .finish()
                    .await
                    .map(drop)
                    .infra("failed to close archive", context),
                Err(e) => {
                    // Closing the writer lets the pump see EOF.
                    drop(writer);
                    Err(e)
                }
            }
        };
        let pump = async {
            let pumped = pump_into(&mut output, upload.as_mut()).await;
            // Dropping the output unblocks a writer stuck on a full pipe.
            drop(output);
            pumped
        };
        let (produced, pumped) = tokio::join!(produce, pump);

        let result = match (produced, pumped) {
            (_, Err(e)) => Err(MirrorError::infra(
                "failed to upload archive",
                context.clone(),
                e,
            )),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Ok(size)) => Ok(size),
        };
        match result {
            Ok(_) => upload
                .finish()
                .await
                .infra("failed to finish archive upload", context),
            Err(e) => {
                if let Err(abort_err) = upload.abort().await {
                    warn!(key = %key, error = %abort_err, "Failed to abort archive upload");
                }
                Err(e)
            }
        }
    }

    /// Import the archive published under `key` in the exports bucket.
    pub async fn import(&self, key: &str) -> MirrorResult<ImportOutcome> {
        let mut context = ErrorContext::new();
        context.insert("key".to_string(), key.to_string());
        let exports = self.ctx.storage.exports.as_ref();

        let object = match exports.head(key).await {
            Ok(object) => object,
            Err(StorageError::NotFound(_)) => {
                return Err(MirrorError::not_found(
                    format!("no archive under {key}"),
                    context,
                ));
            }
            Err(e) => return Err(MirrorError::infra("failed to read archive metadata", context, e)),
        };
        let metadata = ExportMetadata::from_object_metadata(&object.metadata).map_err(|e| {
            MirrorError::bad_request(format!("invalid export metadata: {e}"), context.clone())
        })?;
        let reader = get_reader(exports, key)
            .await
            .infra("failed to open archive", &context)?;
        self.import_from_reader(metadata, reader).await
    }

    /// Import an archive body described by `metadata`.
    pub async fn import_from_reader<R>(
        &self,
        metadata: ExportMetadata,
        reader: R,
    ) -> MirrorResult<ImportOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let span = info_span!(
            "import",
            export_id = %metadata.export_id,
            import_kind = %metadata.kind_name(),
        );
        async move {
            let mut importer = Importer::new(self.ctx.clone(), metadata)?;
            let result = extract_archive(reader, &mut importer).await;
            match &result {
                Ok(outcome) => {
                    info!(destination = %outcome.destination, "Import complete")
                }
                Err(e) => error!(error = %e, "Import failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Best-effort removal of a staged archive.
async fn discard_staged(staging: &dyn ObjectStore, key: &str) {
    if let Err(e) = staging.delete(key).await {
        warn!(key = %key, error = %e, "Failed to remove staged archive");
    }
}
