//! OCI distribution client.
//!
//! Only the calls the mirror needs: blob existence, monolithic blob upload
//! (POST then PUT), manifest push and pull, blob pull. Any non-2xx answer is
//! an error for the caller; nothing is retried here.

use crate::auth::{AccessScope, CredentialProvider, StaticCredentials};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{ACCEPTED_MANIFEST_TYPES, FetchedManifest};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::ContentHash;
use ferry_core::config::RegistryConfig;
use futures::{Stream, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Blob content travelling to or from the registry.
pub type BlobStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Blob and manifest operations on one repository (`<model_id>/<image_name>`).
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Repository name, e.g. `model-1/app`.
    fn name(&self) -> &str;

    /// Whether the blob is already stored in this repository.
    async fn blob_exists(&self, digest: &ContentHash) -> RegistryResult<bool>;

    /// Open an upload session.
    async fn initiate_upload(&self) -> RegistryResult<UploadSession>;

    /// Stream a blob into an open session and commit it under `digest`.
    /// Returns once the registry has acknowledged the commit.
    async fn put_blob(
        &self,
        session: &UploadSession,
        digest: &ContentHash,
        body: BlobStream,
        size_hint: Option<u64>,
    ) -> RegistryResult<()>;

    /// Push a manifest under `tag`.
    async fn put_manifest(&self, tag: &str, manifest: Bytes, media_type: &str)
    -> RegistryResult<()>;

    /// Fetch the manifest for `reference` (tag or digest).
    async fn get_manifest(&self, reference: &str) -> RegistryResult<FetchedManifest>;

    /// Stream a blob's content, with its size when the registry reports it.
    async fn get_blob(&self, digest: &ContentHash)
    -> RegistryResult<(BlobStream, Option<u64>)>;
}

/// Hands out repository handles.
pub trait Registry: Send + Sync {
    fn repository(&self, model_id: &str, image_name: &str) -> Arc<dyn ImageRepository>;
}

/// An open blob upload session.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub location: Url,
}

/// Connection to one registry, shared by repository clients.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl RegistryClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> RegistryResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RegistryError::InvalidUrl(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    pub fn from_config(config: &RegistryConfig) -> RegistryResult<Self> {
        Self::new(
            &config.url,
            config.timeout(),
            Arc::new(StaticCredentials::from_config(&config.auth)),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Client for the `<model_id>/<image_name>` repository.
    pub fn repository_client(&self, model_id: &str, image_name: &str) -> RepositoryClient {
        RepositoryClient {
            registry: self.clone(),
            name: format!("{model_id}/{image_name}"),
        }
    }

    /// Check the registry speaks the distribution API.
    pub async fn ping(&self) -> RegistryResult<()> {
        let url = self.url("/v2/")?;
        let req = self
            .authorize(self.http.get(url.clone()), &AccessScope::registry_catalog())
            .await?;
        let response = req.send().await?;
        check_status("GET", &url, response).await.map(|_| ())
    }

    fn url(&self, path: &str) -> RegistryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RegistryError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        scope: &AccessScope,
    ) -> RegistryResult<reqwest::RequestBuilder> {
        Ok(match self.credentials.authorization(scope).await? {
            Some(value) => req.header(AUTHORIZATION, value),
            None => req,
        })
    }
}

impl Registry for RegistryClient {
    fn repository(&self, model_id: &str, image_name: &str) -> Arc<dyn ImageRepository> {
        Arc::new(self.repository_client(model_id, image_name))
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

/// HTTP client scoped to one repository.
#[derive(Clone, Debug)]
pub struct RepositoryClient {
    registry: RegistryClient,
    name: String,
}

impl RepositoryClient {
    fn scope(&self, actions: &[&str]) -> AccessScope {
        AccessScope::repository(self.name.clone(), actions)
    }

    fn blob_url(&self, digest: &ContentHash) -> RegistryResult<Url> {
        self.registry
            .url(&format!("/v2/{}/blobs/{}", self.name, digest.to_digest()))
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        actions: &[&str],
    ) -> RegistryResult<reqwest::RequestBuilder> {
        self.registry
            .authorize(self.registry.http.request(method, url), &self.scope(actions))
            .await
    }
}

#[async_trait]
impl ImageRepository for RepositoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, digest), fields(repository = %self.name, digest = %digest))]
    async fn blob_exists(&self, digest: &ContentHash) -> RegistryResult<bool> {
        let url = self.blob_url(digest)?;
        let response = self
            .request(Method::HEAD, url.clone(), &["pull"])
            .await?
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status("HEAD", &url, response).await?;
        Ok(true)
    }

    #[instrument(skip(self), fields(repository = %self.name))]
    async fn initiate_upload(&self) -> RegistryResult<UploadSession> {
        let url = self
            .registry
            .url(&format!("/v2/{}/blobs/uploads/", self.name))?;
        let response = self
            .request(Method::POST, url.clone(), &["pull", "push"])
            .await?
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        let response = check_status("POST", &url, response).await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(RegistryError::MissingLocation)?;
        // Location may be relative to the registry root.
        let location = self
            .registry
            .base_url
            .join(location)
            .map_err(|_| RegistryError::MissingLocation)?;
        debug!(location = %location, "Opened blob upload session");
        Ok(UploadSession { location })
    }

    #[instrument(
        skip(self, session, digest, body),
        fields(repository = %self.name, digest = %digest)
    )]
    async fn put_blob(
        &self,
        session: &UploadSession,
        digest: &ContentHash,
        body: BlobStream,
        size_hint: Option<u64>,
    ) -> RegistryResult<()> {
        let mut url = session.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", &digest.to_digest());

        let mut req = self
            .request(Method::PUT, url.clone(), &["pull", "push"])
            .await?
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body));
        if let Some(size) = size_hint {
            req = req.header(CONTENT_LENGTH, size);
        }
        let response = req.send().await?;
        check_status("PUT", &url, response).await?;
        Ok(())
    }

    #[instrument(skip(self, manifest), fields(repository = %self.name, bytes = manifest.len()))]
    async fn put_manifest(
        &self,
        tag: &str,
        manifest: Bytes,
        media_type: &str,
    ) -> RegistryResult<()> {
        let url = self
            .registry
            .url(&format!("/v2/{}/manifests/{tag}", self.name))?;
        let response = self
            .request(Method::PUT, url.clone(), &["pull", "push"])
            .await?
            .header(CONTENT_TYPE, media_type)
            .body(manifest)
            .send()
            .await?;
        check_status("PUT", &url, response).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repository = %self.name))]
    async fn get_manifest(&self, reference: &str) -> RegistryResult<FetchedManifest> {
        let url = self
            .registry
            .url(&format!("/v2/{}/manifests/{reference}", self.name))?;
        let response = self
            .request(Method::GET, url.clone(), &["pull"])
            .await?
            .header(ACCEPT, ACCEPTED_MANIFEST_TYPES.join(", "))
            .send()
            .await?;
        let response = check_status("GET", &url, response).await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?;
        Ok(FetchedManifest { media_type, body })
    }

    #[instrument(skip(self, digest), fields(repository = %self.name, digest = %digest))]
    async fn get_blob(
        &self,
        digest: &ContentHash,
    ) -> RegistryResult<(BlobStream, Option<u64>)> {
        let url = self.blob_url(digest)?;
        let response = self
            .request(Method::GET, url.clone(), &["pull"])
            .await?
            .send()
            .await?;
        let response = check_status("GET", &url, response).await?;
        let size = response.content_length();
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok((Box::pin(stream), size))
    }
}

async fn check_status(
    method: &'static str,
    url: &Url,
    response: reqwest::Response,
) -> RegistryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}
