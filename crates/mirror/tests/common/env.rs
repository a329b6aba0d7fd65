#![allow(dead_code)]

//! A source model, its records and stores, wired into a `MirrorContext`.

use super::registry::FakeRegistry;
use super::storage::CountingStore;
use ferry_core::ContentHash;
use ferry_core::config::MirrorConfig;
use ferry_metadata::{
    Collaborator, CollaboratorAuthorizer, FileRecord, FileRepo, ImageRef, MemoryStore,
    MirrorSettings, ModelRecord, ModelRepo, ReleaseRecord, ReleaseRepo, Role, ScanResult,
    ScanState,
};
use ferry_mirror::{Coordinator, MirrorContext};
use ferry_registry::OCI_MANIFEST_V1;
use ferry_signer::Signer;
use ferry_storage::{ObjectStore, StorageSet};
use std::sync::Arc;
use tempfile::TempDir;

pub const SOURCE_MODEL: &str = "model-src";
pub const MIRRORED_MODEL: &str = "model-dst";
pub const REGISTRY_DOMAIN: &str = "registry.test";

/// Owner of the source model.
pub const OWNER: &str = "alice";
/// Consumer of the source model: may pull images, may not export files.
pub const CONSUMER: &str = "bob";
/// Not a collaborator.
pub const STRANGER: &str = "mallory";

pub struct TestEnv {
    _dir: TempDir,
    pub records: Arc<MemoryStore>,
    pub files: Arc<CountingStore>,
    pub exports: Arc<CountingStore>,
    pub staging: Arc<CountingStore>,
    pub registry: FakeRegistry,
    pub config: MirrorConfig,
}

/// An image pushed to the source registry.
pub struct SeededImage {
    pub manifest: Vec<u8>,
    pub config: ContentHash,
    pub layers: Vec<ContentHash>,
}

impl SeededImage {
    pub fn digests(&self) -> Vec<ContentHash> {
        std::iter::once(self.config)
            .chain(self.layers.iter().copied())
            .collect()
    }
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = CountingStore::new(dir.path().join("files")).await;
        let exports = CountingStore::new(dir.path().join("exports")).await;
        let staging = CountingStore::new(dir.path().join("staging")).await;

        let records = Arc::new(MemoryStore::new());
        records
            .put_model(&ModelRecord {
                id: SOURCE_MODEL.to_string(),
                name: "Source model".to_string(),
                collaborators: vec![
                    Collaborator {
                        entity: OWNER.to_string(),
                        roles: vec![Role::Owner],
                    },
                    Collaborator {
                        entity: CONSUMER.to_string(),
                        roles: vec![Role::Consumer],
                    },
                ],
                mirror: MirrorSettings {
                    destination_model_id: Some(MIRRORED_MODEL.to_string()),
                },
            })
            .await
            .unwrap();

        Self {
            _dir: dir,
            records,
            files,
            exports,
            staging,
            registry: FakeRegistry::new(),
            config: MirrorConfig {
                gzip_chunk_size: 64 * 1024,
                ..MirrorConfig::default()
            },
        }
    }

    pub fn with_config(mut self, config: MirrorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn context(&self) -> MirrorContext {
        MirrorContext::new(
            self.records.clone(),
            Arc::new(CollaboratorAuthorizer),
            StorageSet {
                files: self.files.clone(),
                exports: self.exports.clone(),
                staging: self.staging.clone(),
            },
            Arc::new(self.registry.clone()),
            self.config.clone(),
        )
        .with_registry_domain(Some(REGISTRY_DOMAIN.to_string()))
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.context())
    }

    pub fn signed_coordinator(&self, signer: Arc<dyn Signer>) -> Coordinator {
        Coordinator::new(self.context().with_signer(signer))
    }

    /// Total writes across the exports and staging buckets.
    pub fn archive_writes(&self) -> usize {
        self.exports.writes() + self.staging.writes()
    }

    /// Store `content` and register a file record with the given scans.
    pub async fn add_file(
        &self,
        file_id: &str,
        content: &[u8],
        scan_results: Vec<ScanResult>,
    ) -> FileRecord {
        let path = format!("{SOURCE_MODEL}/{file_id}");
        self.files
            .put(&path, bytes::Bytes::copy_from_slice(content), &Default::default())
            .await
            .unwrap();
        let record = FileRecord {
            id: file_id.to_string(),
            model_id: SOURCE_MODEL.to_string(),
            name: format!("{file_id}.bin"),
            size: content.len() as u64,
            path,
            scan_results,
            complete: true,
        };
        self.records.put_file(&record).await.unwrap();
        record
    }

    /// Push an image to `model-src/<name>:<tag>` and list it in release `semver`.
    pub async fn add_image(
        &self,
        semver: &str,
        name: &str,
        tag: &str,
        config: &[u8],
        layers: &[&[u8]],
    ) -> SeededImage {
        let repository = format!("{SOURCE_MODEL}/{name}");
        let config_digest = self.registry.seed_blob(&repository, config);
        let layer_digests: Vec<ContentHash> = layers
            .iter()
            .map(|layer| self.registry.seed_blob(&repository, layer))
            .collect();
        let manifest = oci_manifest(
            (config_digest, config.len()),
            &layer_digests
                .iter()
                .zip(layers)
                .map(|(d, l)| (*d, l.len()))
                .collect::<Vec<_>>(),
        );
        self.registry
            .seed_manifest(&repository, tag, OCI_MANIFEST_V1, &manifest);

        self.records
            .put_release(&ReleaseRecord {
                model_id: SOURCE_MODEL.to_string(),
                semver: semver.to_string(),
                images: vec![ImageRef {
                    repository: SOURCE_MODEL.to_string(),
                    name: name.to_string(),
                    tag: tag.to_string(),
                }],
                file_ids: Vec::new(),
            })
            .await
            .unwrap();

        SeededImage {
            manifest,
            config: config_digest,
            layers: layer_digests,
        }
    }

    pub async fn mirrored_file(&self, path: &str) -> Option<FileRecord> {
        self.records.get_file_by_path(path).await.unwrap()
    }
}

/// Scan results that allow export.
pub fn clean_scan() -> Vec<ScanResult> {
    vec![ScanResult {
        tool: "clamav".to_string(),
        state: ScanState::Complete,
        is_infected: Some(false),
    }]
}

/// Serialized OCI image manifest over `(digest, size)` pairs.
pub fn oci_manifest(config: (ContentHash, usize), layers: &[(ContentHash, usize)]) -> Vec<u8> {
    let descriptor = |media_type: &str, (digest, size): (ContentHash, usize)| {
        serde_json::json!({
            "mediaType": media_type,
            "digest": digest.to_digest(),
            "size": size,
        })
    };
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST_V1,
        "config": descriptor("application/vnd.oci.image.config.v1+json", config),
        "layers": layers
            .iter()
            .map(|l| descriptor("application/vnd.oci.image.layer.v1.tar+gzip", *l))
            .collect::<Vec<_>>(),
    }))
    .unwrap()
}
