//! In-memory record store.

use crate::error::MetadataResult;
use crate::models::{FileRecord, ModelRecord, ReleaseRecord};
use crate::repos::{FileRepo, ModelRepo, ReleaseRepo};
use crate::store::RecordStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Record store held entirely in memory. Used for tests and for
/// deployments that get their records from a seed document.
#[derive(Default)]
pub struct MemoryStore {
    models: RwLock<HashMap<String, ModelRecord>>,
    files: RwLock<HashMap<String, FileRecord>>,
    releases: RwLock<HashMap<(String, String), ReleaseRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelRepo for MemoryStore {
    async fn get_model(&self, model_id: &str) -> MetadataResult<Option<ModelRecord>> {
        Ok(self.models.read().await.get(model_id).cloned())
    }

    async fn put_model(&self, model: &ModelRecord) -> MetadataResult<()> {
        self.models
            .write()
            .await
            .insert(model.id.clone(), model.clone());
        Ok(())
    }
}

#[async_trait]
impl FileRepo for MemoryStore {
    async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRecord>> {
        Ok(self.files.read().await.get(file_id).cloned())
    }

    async fn get_file_by_path(&self, path: &str) -> MetadataResult<Option<FileRecord>> {
        Ok(self
            .files
            .read()
            .await
            .values()
            .find(|f| f.path == path)
            .cloned())
    }

    async fn put_file(&self, file: &FileRecord) -> MetadataResult<()> {
        self.files
            .write()
            .await
            .insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn mark_file_complete(
        &self,
        path: &str,
        model_id: &str,
        size: u64,
    ) -> MetadataResult<FileRecord> {
        let mut files = self.files.write().await;
        if let Some(existing) = files.values_mut().find(|f| f.path == path) {
            existing.size = size;
            existing.complete = true;
            return Ok(existing.clone());
        }
        let record = FileRecord {
            id: path.to_string(),
            model_id: model_id.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            size,
            path: path.to_string(),
            scan_results: Vec::new(),
            complete: true,
        };
        files.insert(record.id.clone(), record.clone());
        Ok(record)
    }
}

#[async_trait]
impl ReleaseRepo for MemoryStore {
    async fn get_release(
        &self,
        model_id: &str,
        semver: &str,
    ) -> MetadataResult<Option<ReleaseRecord>> {
        Ok(self
            .releases
            .read()
            .await
            .get(&(model_id.to_string(), semver.to_string()))
            .cloned())
    }

    async fn put_release(&self, release: &ReleaseRecord) -> MetadataResult<()> {
        self.releases.write().await.insert(
            (release.model_id.clone(), release.semver.clone()),
            release.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn migrate(&self) -> MetadataResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }
}
