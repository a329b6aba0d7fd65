//! Records and authorization consumed by the mirror pipeline.
//!
//! This crate provides the read side the exporters need (models, files,
//! releases, authorization) and the single write the importers perform
//! (marking an imported file complete).

pub mod authz;
pub mod error;
pub mod memory;
pub mod models;
pub mod repos;
pub mod store;

pub use authz::{Action, AuthorizationResult, Authorizer, CollaboratorAuthorizer};
pub use error::{MetadataError, MetadataResult};
pub use memory::MemoryStore;
pub use models::{
    Collaborator, FileRecord, ImageRef, MirrorSettings, ModelRecord, ReleaseRecord, Role,
    ScanResult, ScanState, SeedData,
};
pub use repos::{FileRepo, ModelRepo, ReleaseRepo};
pub use store::{RecordStore, SqliteStore};

use ferry_core::config::RecordsConfig;
use std::path::Path;
use std::sync::Arc;

/// Create a record store from configuration, applying the seed document if any.
pub async fn from_config(config: &RecordsConfig) -> MetadataResult<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match config {
        RecordsConfig::Memory { .. } => Arc::new(MemoryStore::new()),
        RecordsConfig::Sqlite { path, .. } => Arc::new(SqliteStore::new(path).await?),
    };

    if let Some(seed_path) = config.seed_path() {
        let seed = load_seed(seed_path).await?;
        apply_seed(store.as_ref(), &seed).await?;
        tracing::info!(
            path = %seed_path.display(),
            models = seed.models.len(),
            files = seed.files.len(),
            releases = seed.releases.len(),
            "Seeded record store"
        );
    }

    Ok(store)
}

/// Read a seed document from disk.
pub async fn load_seed(path: &Path) -> MetadataResult<SeedData> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        MetadataError::Config(format!("failed to read seed {}: {e}", path.display()))
    })?;
    Ok(SeedData::from_json(&raw)?)
}

/// Insert every record of `seed`, replacing existing ones with the same key.
pub async fn apply_seed(store: &dyn RecordStore, seed: &SeedData) -> MetadataResult<()> {
    for model in &seed.models {
        store.put_model(model).await?;
    }
    for file in &seed.files {
        store.put_file(file).await?;
    }
    for release in &seed.releases {
        store.put_release(release).await?;
    }
    Ok(())
}
