#![allow(dead_code)]

//! Filesystem-backed object stores that count writes.

use async_trait::async_trait;
use bytes::Bytes;
use ferry_storage::{
    ByteStream, FilesystemBackend, ObjectMeta, ObjectMetadata, ObjectStore, StorageError,
    StorageResult, StreamingUpload,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Object store wrapper recording every write attempt.
pub struct CountingStore {
    inner: FilesystemBackend,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl CountingStore {
    pub async fn new(root: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            inner: FilesystemBackend::new(root).await.unwrap(),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Number of `put` and `put_stream` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn record_write(&self) -> StorageResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> StorageResult<()> {
        self.record_write()?;
        self.inner.put(key, data, metadata).await
    }

    async fn put_stream(
        &self,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.record_write()?;
        self.inner.put_stream(key, metadata).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
