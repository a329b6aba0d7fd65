//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Filesystem storage rooted at `path`.
    pub fn filesystem(path: impl Into<PathBuf>) -> Self {
        Self::Filesystem { path: path.into() }
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// The three object stores the mirror pipeline talks to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoragesConfig {
    /// Where model files live (export source, import destination).
    #[serde(default = "default_files_storage")]
    pub files: StorageConfig,
    /// Where finished export archives are published for peers.
    #[serde(default = "default_exports_storage")]
    pub exports: StorageConfig,
    /// Temporary location for archives awaiting a signature.
    #[serde(default = "default_staging_storage")]
    pub staging: StorageConfig,
}

fn default_files_storage() -> StorageConfig {
    StorageConfig::filesystem("./data/files")
}

fn default_exports_storage() -> StorageConfig {
    StorageConfig::filesystem("./data/exports")
}

fn default_staging_storage() -> StorageConfig {
    StorageConfig::filesystem("./data/staging")
}

impl Default for StoragesConfig {
    fn default() -> Self {
        Self {
            files: default_files_storage(),
            exports: default_exports_storage(),
            staging: default_staging_storage(),
        }
    }
}

impl StoragesConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.files
            .validate()
            .map_err(|e| format!("storage.files: {e}"))?;
        self.exports
            .validate()
            .map_err(|e| format!("storage.exports: {e}"))?;
        self.staging
            .validate()
            .map_err(|e| format!("storage.staging: {e}"))
    }
}

/// Registry authentication.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryAuthConfig {
    #[default]
    Anonymous,
    Basic {
        username: String,
        /// WARNING: Prefer FERRY_REGISTRY__AUTH__PASSWORD over storing in config.
        password: String,
    },
    Bearer {
        token: String,
    },
}

/// OCI registry connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry base URL (e.g., "https://registry.example.com").
    #[serde(default = "default_registry_url")]
    pub url: String,
    /// Host recorded in distribution package names. Defaults to the URL's authority.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub auth: RegistryAuthConfig,
    /// Per-request timeout in seconds. Blob transfers can be large.
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_registry_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_registry_timeout_secs() -> u64 {
    300
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            domain: None,
            auth: RegistryAuthConfig::default(),
            timeout_secs: default_registry_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Domain used when addressing images, falling back to the URL authority.
    pub fn effective_domain(&self) -> Option<String> {
        if let Some(domain) = &self.domain {
            return Some(domain.clone());
        }
        let rest = self
            .url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))?;
        let authority = rest.split('/').next().unwrap_or_default();
        (!authority.is_empty()).then(|| authority.to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!(
                "registry.url must be an http(s) URL, got {:?}",
                self.url
            ));
        }
        if self.timeout_secs == 0 {
            return Err("registry.timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Export/import pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Largest file that may be exported, in bytes.
    #[serde(default = "default_export_max_size")]
    pub export_max_size: u64,
    /// Require a complete, clean scan before a file may be exported.
    #[serde(default = "default_scanning_enabled")]
    pub scanning_enabled: bool,
    /// Buffer size between the archive writer and the gzip output.
    #[serde(default = "default_gzip_chunk_size")]
    pub gzip_chunk_size: usize,
}

fn default_export_max_size() -> u64 {
    100 * 1024 * 1024 * 1024 // 100 GiB
}

fn default_scanning_enabled() -> bool {
    true
}

fn default_gzip_chunk_size() -> usize {
    crate::DEFAULT_GZIP_CHUNK_SIZE
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            export_max_size: default_export_max_size(),
            scanning_enabled: default_scanning_enabled(),
            gzip_chunk_size: default_gzip_chunk_size(),
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.gzip_chunk_size == 0 {
            return Err("mirror.gzip_chunk_size cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Signing configuration. Presence enables signed exports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key name (e.g., "ferry.example.com-1").
    pub key_name: String,
    /// Private key source.
    pub private_key: PrivateKeyConfig,
}

/// Private key source configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PrivateKeyConfig {
    /// Key stored in a file.
    File {
        /// Path to the private key file.
        path: PathBuf,
    },
    /// Key stored in environment variable.
    Env {
        /// Environment variable name.
        var: String,
    },
    /// Key provided directly as a value (NOT recommended for production).
    Value {
        /// The signing key in `name:base64` format.
        key: String,
    },
    /// Generate a new key (for development only).
    Generate,
}

/// Where model, file and release records come from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecordsConfig {
    /// In-memory records, optionally seeded from a JSON document.
    Memory {
        #[serde(default)]
        seed_path: Option<PathBuf>,
    },
    /// SQLite database file, optionally seeded on startup.
    Sqlite {
        path: PathBuf,
        #[serde(default)]
        seed_path: Option<PathBuf>,
    },
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self::Memory { seed_path: None }
    }
}

impl RecordsConfig {
    pub fn seed_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Memory { seed_path } | Self::Sqlite { seed_path, .. } => seed_path.as_ref(),
        }
    }
}

/// A principal allowed to call the API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrincipalConfig {
    /// Identity recorded as the exporter of archives.
    pub name: String,
    /// Pre-computed hash of the bearer token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
}

/// API authentication configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
}

impl AuthConfig {
    /// Create a test configuration with a single principal.
    ///
    /// **For testing only.** The hash is deterministic but not a real token.
    pub fn for_testing() -> Self {
        Self {
            principals: vec![PrincipalConfig {
                name: "test-user".to_string(),
                // SHA256 of "test-token"
                token_hash: "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e"
                    .to_string(),
            }],
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for principal in &self.principals {
            let hash = &principal.token_hash;
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!(
                    "auth.principals[{}].token_hash must be 64 hex characters",
                    principal.name
                ));
            }
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StoragesConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// Signing configuration (optional).
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub records: RecordsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, in-memory records
    /// and a dummy principal.
    pub fn for_testing() -> Self {
        Self {
            auth: AuthConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.registry.validate()?;
        self.mirror.validate()?;
        self.auth.validate()
    }
}
