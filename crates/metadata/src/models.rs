//! Records owned by the governance instance and consumed by the mirror pipeline.
//!
//! The pipeline only reads these before an export and writes them after an
//! import; the rest of their lifecycle belongs to other services.

use serde::{Deserialize, Serialize};

// =============================================================================
// Models
// =============================================================================

/// A model and the people allowed to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub mirror: MirrorSettings,
}

impl ModelRecord {
    /// Roles granted to `user`, empty if they are not a collaborator.
    pub fn roles_of(&self, user: &str) -> &[Role] {
        self.collaborators
            .iter()
            .find(|c| c.entity == user)
            .map(|c| c.roles.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    /// User identity.
    pub entity: String,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Contributor,
    Consumer,
}

/// Where a model is mirrored to on the peer instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSettings {
    pub destination_model_id: Option<String>,
}

// =============================================================================
// Files
// =============================================================================

/// A file stored in the files bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub model_id: String,
    pub name: String,
    pub size: u64,
    /// Object key in the files bucket.
    pub path: String,
    #[serde(default)]
    pub scan_results: Vec<ScanResult>,
    /// Set once the content is fully present in storage.
    #[serde(default)]
    pub complete: bool,
}

/// Outcome of one scanning tool on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub tool: String,
    pub state: ScanState,
    #[serde(default)]
    pub is_infected: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    NotScanned,
    InProgress,
    Complete,
    Error,
}

// =============================================================================
// Releases
// =============================================================================

/// A model release and the images it ships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub model_id: String,
    pub semver: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub file_ids: Vec<String>,
}

impl ReleaseRecord {
    pub fn find_image(&self, name: &str, tag: &str) -> Option<&ImageRef> {
        self.images.iter().find(|i| i.name == name && i.tag == tag)
    }
}

/// An image in the registry, namespaced by its repository (the model id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub name: String,
    pub tag: String,
}

// =============================================================================
// Seed document
// =============================================================================

/// Records loaded at startup from `records.seed_path`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub releases: Vec<ReleaseRecord>,
}

impl SeedData {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_parses_with_defaults() {
        let seed = SeedData::from_json(
            r#"{
                "models": [{"id": "m1", "collaborators": [{"entity": "alice", "roles": ["owner"]}],
                            "mirror": {"destination_model_id": "m1-peer"}}],
                "files": [{"id": "f1", "model_id": "m1", "name": "weights.bin", "size": 10,
                           "path": "m1/f1",
                           "scan_results": [{"tool": "clamav", "state": "complete", "is_infected": false}]}]
            }"#,
        )
        .unwrap();

        assert_eq!(seed.models[0].roles_of("alice"), &[Role::Owner]);
        assert!(seed.models[0].roles_of("bob").is_empty());
        assert_eq!(seed.files[0].scan_results[0].state, ScanState::Complete);
        assert!(!seed.files[0].complete);
        assert!(seed.releases.is_empty());
    }

    #[test]
    fn release_finds_image_by_name_and_tag() {
        let release = ReleaseRecord {
            model_id: "m1".to_string(),
            semver: "1.0.0".to_string(),
            images: vec![ImageRef {
                repository: "m1".to_string(),
                name: "app".to_string(),
                tag: "v1".to_string(),
            }],
            file_ids: vec![],
        };
        assert!(release.find_image("app", "v1").is_some());
        assert!(release.find_image("app", "v2").is_none());
    }
}
