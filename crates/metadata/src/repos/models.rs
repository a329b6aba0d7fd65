//! Model repository trait.

use crate::error::MetadataResult;
use crate::models::ModelRecord;
use async_trait::async_trait;

/// Repository for model records.
#[async_trait]
pub trait ModelRepo: Send + Sync {
    /// Get a model by ID.
    async fn get_model(&self, model_id: &str) -> MetadataResult<Option<ModelRecord>>;

    /// Insert or replace a model.
    async fn put_model(&self, model: &ModelRecord) -> MetadataResult<()>;
}
