//! File repository trait.

use crate::error::MetadataResult;
use crate::models::FileRecord;
use async_trait::async_trait;

/// Repository for file records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Get a file by ID.
    async fn get_file(&self, file_id: &str) -> MetadataResult<Option<FileRecord>>;

    /// Get a file by its object key in the files bucket.
    async fn get_file_by_path(&self, path: &str) -> MetadataResult<Option<FileRecord>>;

    /// Insert or replace a file.
    async fn put_file(&self, file: &FileRecord) -> MetadataResult<()>;

    /// Record that the content at `path` is fully present, creating the
    /// record if it does not exist yet. Returns the stored record.
    async fn mark_file_complete(
        &self,
        path: &str,
        model_id: &str,
        size: u64,
    ) -> MetadataResult<FileRecord>;

    /// Whether a complete file exists at `path`.
    async fn is_path_complete(&self, path: &str) -> MetadataResult<bool> {
        Ok(self
            .get_file_by_path(path)
            .await?
            .is_some_and(|f| f.complete))
    }
}
