#![allow(dead_code)]

//! In-process registry standing in for an OCI distribution endpoint.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ferry_core::ContentHash;
use ferry_registry::{
    BlobStream, FetchedManifest, ImageManifest, ImageRepository, Registry, RegistryError,
    RegistryResult, UploadSession,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Repo {
    blobs: HashMap<ContentHash, Bytes>,
    manifests: HashMap<String, FetchedManifest>,
}

#[derive(Default)]
struct Inner {
    repos: Mutex<HashMap<String, Repo>>,
    blob_exists_calls: AtomicUsize,
    put_blob_calls: AtomicUsize,
    put_manifest_calls: AtomicUsize,
    /// Digests a pushed manifest referenced that were not stored at push time.
    missing_at_manifest_push: Mutex<Vec<ContentHash>>,
}

/// Fake registry. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    inner: Arc<Inner>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob directly, bypassing the counters.
    pub fn seed_blob(&self, repository: &str, data: &[u8]) -> ContentHash {
        let digest = ContentHash::compute(data);
        self.with_repo(repository, |repo| {
            repo.blobs.insert(digest, Bytes::copy_from_slice(data));
        });
        digest
    }

    /// Store a manifest directly, bypassing the counters.
    pub fn seed_manifest(&self, repository: &str, tag: &str, media_type: &str, body: &[u8]) {
        self.with_repo(repository, |repo| {
            repo.manifests.insert(
                tag.to_string(),
                FetchedManifest {
                    media_type: media_type.to_string(),
                    body: Bytes::copy_from_slice(body),
                },
            );
        });
    }

    pub fn blob(&self, repository: &str, digest: &ContentHash) -> Option<Bytes> {
        self.with_repo(repository, |repo| repo.blobs.get(digest).cloned())
    }

    pub fn manifest(&self, repository: &str, tag: &str) -> Option<FetchedManifest> {
        self.with_repo(repository, |repo| repo.manifests.get(tag).cloned())
    }

    pub fn blob_count(&self, repository: &str) -> usize {
        self.with_repo(repository, |repo| repo.blobs.len())
    }

    pub fn blob_exists_calls(&self) -> usize {
        self.inner.blob_exists_calls.load(Ordering::SeqCst)
    }

    pub fn put_blob_calls(&self) -> usize {
        self.inner.put_blob_calls.load(Ordering::SeqCst)
    }

    pub fn put_manifest_calls(&self) -> usize {
        self.inner.put_manifest_calls.load(Ordering::SeqCst)
    }

    pub fn missing_at_manifest_push(&self) -> Vec<ContentHash> {
        self.inner.missing_at_manifest_push.lock().unwrap().clone()
    }

    fn with_repo<T>(&self, repository: &str, f: impl FnOnce(&mut Repo) -> T) -> T {
        let mut repos = self.inner.repos.lock().unwrap();
        f(repos.entry(repository.to_string()).or_default())
    }
}

impl Registry for FakeRegistry {
    fn repository(&self, model_id: &str, image_name: &str) -> Arc<dyn ImageRepository> {
        Arc::new(FakeRepository {
            registry: self.clone(),
            name: format!("{model_id}/{image_name}"),
        })
    }
}

struct FakeRepository {
    registry: FakeRegistry,
    name: String,
}

fn rejected(method: &'static str, url: &str, status: u16, body: &str) -> RegistryError {
    RegistryError::Status {
        method,
        url: url.to_string(),
        status,
        body: body.to_string(),
    }
}

#[async_trait]
impl ImageRepository for FakeRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn blob_exists(&self, digest: &ContentHash) -> RegistryResult<bool> {
        self.registry
            .inner
            .blob_exists_calls
            .fetch_add(1, Ordering::SeqCst);
        Ok(self
            .registry
            .with_repo(&self.name, |repo| repo.blobs.contains_key(digest)))
    }

    async fn initiate_upload(&self) -> RegistryResult<UploadSession> {
        let location = format!("http://fake.registry/v2/{}/blobs/uploads/1", self.name);
        Ok(UploadSession {
            location: location.parse().map_err(|_| RegistryError::MissingLocation)?,
        })
    }

    async fn put_blob(
        &self,
        _session: &UploadSession,
        digest: &ContentHash,
        mut body: BlobStream,
        _size_hint: Option<u64>,
    ) -> RegistryResult<()> {
        self.registry
            .inner
            .put_blob_calls
            .fetch_add(1, Ordering::SeqCst);
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| rejected("PUT", &self.name, 500, &e.to_string()))?;
            data.extend_from_slice(&chunk);
        }
        if ContentHash::compute(&data) != *digest {
            return Err(rejected("PUT", &self.name, 400, "DIGEST_INVALID"));
        }
        self.registry.with_repo(&self.name, |repo| {
            repo.blobs.insert(*digest, data.freeze());
        });
        Ok(())
    }

    async fn put_manifest(
        &self,
        tag: &str,
        manifest: Bytes,
        media_type: &str,
    ) -> RegistryResult<()> {
        self.registry
            .inner
            .put_manifest_calls
            .fetch_add(1, Ordering::SeqCst);
        let parsed = ImageManifest::parse(&manifest)?;
        let referenced: HashSet<ContentHash> = parsed.blob_digests()?.into_iter().collect();
        self.registry.with_repo(&self.name, |repo| {
            let missing: Vec<ContentHash> = referenced
                .iter()
                .filter(|d| !repo.blobs.contains_key(*d))
                .copied()
                .collect();
            self.registry
                .inner
                .missing_at_manifest_push
                .lock()
                .unwrap()
                .extend(missing);
            repo.manifests.insert(
                tag.to_string(),
                FetchedManifest {
                    media_type: media_type.to_string(),
                    body: manifest,
                },
            );
        });
        Ok(())
    }

    async fn get_manifest(&self, reference: &str) -> RegistryResult<FetchedManifest> {
        self.registry
            .manifest(&self.name, reference)
            .ok_or_else(|| rejected("GET", &self.name, 404, "MANIFEST_UNKNOWN"))
    }

    async fn get_blob(&self, digest: &ContentHash) -> RegistryResult<(BlobStream, Option<u64>)> {
        let data = self
            .registry
            .blob(&self.name, digest)
            .ok_or_else(|| rejected("GET", &self.name, 404, "BLOB_UNKNOWN"))?;
        let size = data.len() as u64;
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok((Box::pin(futures::stream::iter(chunks)), Some(size)))
    }
}
