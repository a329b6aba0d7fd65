//! Object storage abstraction and backends for ferry.
//!
//! This crate provides:
//! - An object store trait with atomic puts, streaming uploads and user metadata
//! - Backends: local filesystem and S3-compatible
//! - The set of buckets the mirror pipeline uses (files, exports, staging)
//! - `tokio::io` bridges for streaming objects in and out

pub mod backends;
pub mod error;
pub mod io;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use io::{ObjectReader, get_reader, put_reader, stream_reader};
pub use traits::{ByteStream, ObjectMeta, ObjectMetadata, ObjectStore, StreamingUpload};

use ferry_core::config::{StorageConfig, StoragesConfig};
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

/// The object stores the mirror pipeline reads from and writes to.
#[derive(Clone)]
pub struct StorageSet {
    /// Model files: export source and import destination.
    pub files: Arc<dyn ObjectStore>,
    /// Published archives, visible to peers.
    pub exports: Arc<dyn ObjectStore>,
    /// Archives awaiting a signature.
    pub staging: Arc<dyn ObjectStore>,
}

impl StorageSet {
    pub async fn from_config(config: &StoragesConfig) -> StorageResult<Self> {
        Ok(Self {
            files: from_config(&config.files).await?,
            exports: from_config(&config.exports).await?,
            staging: from_config(&config.staging).await?,
        })
    }

    /// Check every backend, naming the one that failed.
    pub async fn health_check(&self) -> StorageResult<()> {
        for (name, store) in [
            ("files", &self.files),
            ("exports", &self.exports),
            ("staging", &self.staging),
        ] {
            store.health_check().await.map_err(|e| {
                StorageError::Config(format!(
                    "{name} storage ({}) unhealthy: {e}",
                    store.backend_name()
                ))
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StorageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSet")
            .field("files", &self.files.backend_name())
            .field("exports", &self.exports.backend_name())
            .field("staging", &self.staging.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"), &ObjectMetadata::new())
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            prefix: Some("ferry".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn storage_set_keeps_buckets_separate() {
        let temp = tempdir().unwrap();
        let config = StoragesConfig {
            files: StorageConfig::filesystem(temp.path().join("files")),
            exports: StorageConfig::filesystem(temp.path().join("exports")),
            staging: StorageConfig::filesystem(temp.path().join("staging")),
        };

        let set = StorageSet::from_config(&config).await.unwrap();
        set.health_check().await.unwrap();
        set.staging
            .put("exp/a.tar.gz", Bytes::from_static(b"x"), &ObjectMetadata::new())
            .await
            .unwrap();
        assert!(set.staging.exists("exp/a.tar.gz").await.unwrap());
        assert!(!set.exports.exists("exp/a.tar.gz").await.unwrap());
    }
}
