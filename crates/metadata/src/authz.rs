//! Authorization seam.
//!
//! Policy evaluation lives outside the mirror pipeline; the pipeline only asks
//! "may this user do this to that" and reports the answer.

use crate::error::MetadataResult;
use crate::models::{ModelRecord, Role};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Action being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read a file's content to export it.
    ExportFile,
    /// Pull an image from the model's registry repository.
    PullImage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExportFile => "export_file",
            Self::PullImage => "pull_image",
        }
    }

    /// Roles allowed to perform this action.
    fn allowed_roles(&self) -> &'static [Role] {
        match self {
            Self::ExportFile => &[Role::Owner, Role::Contributor],
            Self::PullImage => &[Role::Owner, Role::Contributor, Role::Consumer],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer from the authorizer. `info` explains a denial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorizationResult {
    pub success: bool,
    pub info: BTreeMap<String, String>,
}

impl AuthorizationResult {
    pub fn allow() -> Self {
        Self {
            success: true,
            info: BTreeMap::new(),
        }
    }

    pub fn deny(info: BTreeMap<String, String>) -> Self {
        Self {
            success: false,
            info,
        }
    }
}

/// Decides whether a user may act on a model's artefact.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        user: &str,
        model: &ModelRecord,
        action: Action,
        target: &str,
    ) -> MetadataResult<AuthorizationResult>;
}

/// Role-based authorizer over the model's collaborator list.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollaboratorAuthorizer;

#[async_trait]
impl Authorizer for CollaboratorAuthorizer {
    async fn authorize(
        &self,
        user: &str,
        model: &ModelRecord,
        action: Action,
        target: &str,
    ) -> MetadataResult<AuthorizationResult> {
        let roles = model.roles_of(user);
        if roles.iter().any(|r| action.allowed_roles().contains(r)) {
            return Ok(AuthorizationResult::allow());
        }

        let mut info = BTreeMap::new();
        info.insert("user".to_string(), user.to_string());
        info.insert("modelId".to_string(), model.id.clone());
        info.insert("action".to_string(), action.to_string());
        info.insert("target".to_string(), target.to_string());
        info.insert(
            "reason".to_string(),
            if roles.is_empty() {
                "not a collaborator on this model".to_string()
            } else {
                "missing a role that permits this action".to_string()
            },
        );
        Ok(AuthorizationResult::deny(info))
    }
}
