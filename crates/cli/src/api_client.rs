use anyhow::{Context, Result};
use ferry_core::ExportMetadata;
use reqwest::Url;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.map(str::to_string),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            match serde_json::from_str::<ErrorBody>(&body) {
                Ok(err) => anyhow::bail!("API error ({status}, {}): {}", err.code, err.message),
                Err(_) => anyhow::bail!("API error ({status}): {body}"),
            }
        }
        serde_json::from_str(&body).with_context(|| format!("unexpected response body: {body}"))
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let url = self.url("/v1/health")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn whoami(&self) -> Result<WhoamiResponse> {
        let url = self.url("/v1/auth/whoami")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn signing_key(&self) -> Result<SigningKeyResponse> {
        let url = self.url("/v1/signing-key")?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn export_file(&self, req: FileExportRequest) -> Result<ExportAccepted> {
        let url = self.url("/v1/exports/files")?;
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn export_image(&self, req: ImageExportRequest) -> Result<ExportAccepted> {
        let url = self.url("/v1/exports/images")?;
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn export_status(&self, export_id: &str) -> Result<ExportStatusResponse> {
        let url = self.url(&format!("/v1/exports/{export_id}"))?;
        self.send_json(self.http.get(url)).await
    }

    pub async fn import(&self, key: &str) -> Result<ImportResponse> {
        let url = self.url("/v1/imports")?;
        let req = ImportRequest {
            key: key.to_string(),
        };
        self.send_json(self.http.post(url).json(&req)).await
    }
}

// =============================================================================
// Request/response types (mirrored from server handlers)
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct WhoamiResponse {
    pub principal: String,
    pub signing_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct SigningKeyResponse {
    pub enabled: bool,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileExportRequest {
    pub model_id: String,
    pub file_id: String,
}

#[derive(Debug, Serialize)]
pub struct ImageExportRequest {
    pub model_id: String,
    pub release: String,
    pub image_name: String,
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct ExportAccepted {
    pub export_id: String,
    pub key: String,
    pub import_kind: String,
    pub signed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExportStatusResponse {
    pub export_id: String,
    pub key: String,
    pub import_kind: String,
    /// `running`, `committed`, `abandoned` or `failed`.
    pub state: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExportStatusResponse {
    pub fn is_finished(&self) -> bool {
        self.state != "running"
    }
}

#[derive(Debug, Serialize)]
pub struct ImportRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportResponse {
    pub metadata: ExportMetadata,
    pub source: String,
    pub destination: String,
    pub detail: ImportDetail,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportDetail {
    File {
        size: u64,
        already_complete: bool,
    },
    Image {
        blobs_uploaded: usize,
        blobs_skipped: usize,
        media_type: String,
    },
}
