//! Collaborators shared by exporters, importers and the coordinator.

use ferry_core::config::MirrorConfig;
use ferry_metadata::{Authorizer, RecordStore};
use ferry_registry::Registry;
use ferry_signer::Signer;
use ferry_storage::StorageSet;
use std::sync::Arc;

/// Everything one export or import needs. Cheap to clone.
#[derive(Clone)]
pub struct MirrorContext {
    pub records: Arc<dyn RecordStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub storage: StorageSet,
    pub registry: Arc<dyn Registry>,
    /// Domain recorded in distribution package names.
    pub registry_domain: Option<String>,
    pub config: MirrorConfig,
    /// Present when signed exports are enabled.
    pub signer: Option<Arc<dyn Signer>>,
}

impl MirrorContext {
    pub fn new(
        records: Arc<dyn RecordStore>,
        authorizer: Arc<dyn Authorizer>,
        storage: StorageSet,
        registry: Arc<dyn Registry>,
        config: MirrorConfig,
    ) -> Self {
        Self {
            records,
            authorizer,
            storage,
            registry,
            registry_domain: None,
            config,
            signer: None,
        }
    }

    pub fn with_registry_domain(mut self, domain: Option<String>) -> Self {
        self.registry_domain = domain;
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }
}

impl std::fmt::Debug for MirrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorContext")
            .field("storage", &self.storage)
            .field("registry_domain", &self.registry_domain)
            .field("config", &self.config)
            .field("signing", &self.signer.as_ref().map(|s| s.key_name().to_string()))
            .finish_non_exhaustive()
    }
}
