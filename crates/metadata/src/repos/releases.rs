//! Release repository trait.

use crate::error::MetadataResult;
use crate::models::ReleaseRecord;
use async_trait::async_trait;

/// Repository for releases.
#[async_trait]
pub trait ReleaseRepo: Send + Sync {
    /// Get a release by model and semantic version.
    async fn get_release(
        &self,
        model_id: &str,
        semver: &str,
    ) -> MetadataResult<Option<ReleaseRecord>>;

    /// Insert or replace a release.
    async fn put_release(&self, release: &ReleaseRecord) -> MetadataResult<()>;
}
