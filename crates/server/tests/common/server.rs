//! Server test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use ferry_core::config::{AppConfig, AuthConfig, PrincipalConfig, RegistryConfig};
use ferry_metadata::{
    Collaborator, CollaboratorAuthorizer, FileRecord, FileRepo, MemoryStore, MirrorSettings,
    ModelRecord, ModelRepo, Role, ScanResult, ScanState,
};
use ferry_mirror::{Coordinator, MirrorContext};
use ferry_registry::RegistryClient;
use ferry_server::auth::hash_token;
use ferry_server::{AppState, ExportState, ExportStatus, create_router};
use ferry_signer::{ArchiveSigner, Signer};
use ferry_storage::{FilesystemBackend, ObjectStore, StorageSet};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

pub const SOURCE_MODEL: &str = "model-src";
pub const MIRRORED_MODEL: &str = "model-dst";

/// Bearer token of the source model's owner, principal "alice".
pub const OWNER_TOKEN: &str = "alice-token";
/// Bearer token of a principal with no role on any model.
pub const STRANGER_TOKEN: &str = "mallory-token";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    pub records: Arc<MemoryStore>,
    pub storage: StorageSet,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Unsigned exports, filesystem buckets, one mirrored source model.
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Same as [`TestServer::new`] with export signing enabled.
    pub async fn signed() -> Self {
        Self::build(Some(Arc::new(ArchiveSigner::generate("ferry-test-1")))).await
    }

    async fn build(signer: Option<Arc<ArchiveSigner>>) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut buckets = Vec::new();
        for name in ["files", "exports", "staging"] {
            let store: Arc<dyn ObjectStore> = Arc::new(
                FilesystemBackend::new(temp_dir.path().join(name))
                    .await
                    .expect("Failed to create storage backend"),
            );
            buckets.push(store);
        }
        let storage = StorageSet {
            files: buckets[0].clone(),
            exports: buckets[1].clone(),
            staging: buckets[2].clone(),
        };

        let records = Arc::new(MemoryStore::new());
        records
            .put_model(&ModelRecord {
                id: SOURCE_MODEL.to_string(),
                name: "Source model".to_string(),
                collaborators: vec![Collaborator {
                    entity: "alice".to_string(),
                    roles: vec![Role::Owner],
                }],
                mirror: MirrorSettings {
                    destination_model_id: Some(MIRRORED_MODEL.to_string()),
                },
            })
            .await
            .expect("Failed to seed model");

        // Never contacted by the file flows these tests drive.
        let registry = RegistryClient::from_config(&RegistryConfig::default())
            .expect("Failed to create registry client");

        let config = AppConfig {
            auth: AuthConfig {
                principals: vec![
                    PrincipalConfig {
                        name: "alice".to_string(),
                        token_hash: hash_token(OWNER_TOKEN),
                    },
                    PrincipalConfig {
                        name: "mallory".to_string(),
                        token_hash: hash_token(STRANGER_TOKEN),
                    },
                ],
            },
            ..AppConfig::for_testing()
        };

        let mut ctx = MirrorContext::new(
            records.clone(),
            Arc::new(CollaboratorAuthorizer),
            storage.clone(),
            Arc::new(registry),
            config.mirror.clone(),
        );
        if let Some(signer) = &signer {
            ctx = ctx.with_signer(signer.clone() as Arc<dyn Signer>);
        }

        let state = AppState::new(config, Coordinator::new(ctx), signer);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            records,
            storage,
            _temp_dir: temp_dir,
        }
    }

    /// Store `content` under the source model with a clean, complete scan.
    pub async fn add_file(&self, file_id: &str, content: &[u8]) -> FileRecord {
        let path = format!("{SOURCE_MODEL}/{file_id}");
        self.storage
            .files
            .put(&path, bytes::Bytes::copy_from_slice(content), &Default::default())
            .await
            .expect("Failed to store file");
        let record = FileRecord {
            id: file_id.to_string(),
            model_id: SOURCE_MODEL.to_string(),
            name: format!("{file_id}.bin"),
            size: content.len() as u64,
            path,
            scan_results: vec![ScanResult {
                tool: "clamav".to_string(),
                state: ScanState::Complete,
                is_infected: Some(false),
            }],
            complete: true,
        };
        self.records
            .put_file(&record)
            .await
            .expect("Failed to store file record");
        record
    }

    /// Poll the export tracker until the export leaves `running`.
    pub async fn wait_for_export(&self, export_id: &str) -> ExportStatus {
        for _ in 0..500 {
            if let Some(status) = self.state.exports.get(export_id).await
                && status.state != ExportState::Running
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("export {export_id} did not finish in time");
    }
}

/// Send a request through the router and decode the JSON response body.
/// An empty body decodes to `Value::Null`.
#[allow(dead_code)]
pub async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Send a GET and return the raw body as text.
#[allow(dead_code)]
pub async fn text_request(router: &axum::Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}
