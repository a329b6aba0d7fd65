//! Registry credentials.
//!
//! Every request carries credentials resolved for an access scope, the same
//! `{type, name, actions}` triple a token service would be asked to grant.

use crate::error::RegistryResult;
use async_trait::async_trait;
use base64::Engine;
use ferry_core::config::RegistryAuthConfig;
use std::fmt;

/// What the scope names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Repository,
    Registry,
}

impl ScopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Registry => "registry",
        }
    }
}

/// Access scope requested for a call, e.g. `repository:model-1/app:pull,push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessScope {
    pub kind: ScopeKind,
    pub name: String,
    pub actions: Vec<String>,
}

impl AccessScope {
    pub fn repository(name: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            kind: ScopeKind::Repository,
            name: name.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn registry_catalog() -> Self {
        Self {
            kind: ScopeKind::Registry,
            name: "catalog".to_string(),
            actions: vec!["*".to_string()],
        }
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.kind.as_str(),
            self.name,
            self.actions.join(",")
        )
    }
}

/// Issues credentials for a scope.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Value for the `Authorization` header, or `None` for anonymous access.
    async fn authorization(&self, scope: &AccessScope) -> RegistryResult<Option<String>>;
}

/// Credentials fixed at startup, valid for every scope.
#[derive(Clone)]
pub struct StaticCredentials {
    header: Option<String>,
}

impl StaticCredentials {
    pub fn anonymous() -> Self {
        Self { header: None }
    }

    pub fn basic(username: &str, password: &str) -> Self {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Self {
            header: Some(format!("Basic {encoded}")),
        }
    }

    pub fn bearer(token: &str) -> Self {
        Self {
            header: Some(format!("Bearer {token}")),
        }
    }

    pub fn from_config(config: &RegistryAuthConfig) -> Self {
        match config {
            RegistryAuthConfig::Anonymous => Self::anonymous(),
            RegistryAuthConfig::Basic { username, password } => Self::basic(username, password),
            RegistryAuthConfig::Bearer { token } => Self::bearer(token),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("anonymous", &self.header.is_none())
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn authorization(&self, _scope: &AccessScope) -> RegistryResult<Option<String>> {
        Ok(self.header.clone())
    }
}
