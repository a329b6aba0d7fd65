//! Image manifest documents.

use crate::error::{RegistryError, RegistryResult};
use bytes::Bytes;
use ferry_core::ContentHash;
use serde::{Deserialize, Serialize};

/// OCI image manifest media type.
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker distribution manifest (schema 2) media type.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media types accepted when pushing or pulling manifests.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[OCI_MANIFEST_V1, DOCKER_MANIFEST_V2];

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// The parts of an image manifest the mirror needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn parse(raw: &[u8]) -> RegistryResult<Self> {
        serde_json::from_slice(raw).map_err(|e| RegistryError::InvalidManifest(e.to_string()))
    }

    /// The manifest's media type if it is one we can push.
    pub fn accepted_media_type(&self) -> Option<&'static str> {
        let media_type = self.media_type.as_deref()?;
        ACCEPTED_MANIFEST_TYPES
            .iter()
            .copied()
            .find(|t| *t == media_type)
    }

    /// Every blob the manifest references: config first, then layers.
    pub fn blob_digests(&self) -> RegistryResult<Vec<ContentHash>> {
        self.config
            .iter()
            .chain(self.layers.iter())
            .map(|d| {
                ContentHash::from_digest(&d.digest).map_err(|e| {
                    RegistryError::InvalidManifest(format!("bad digest {}: {e}", d.digest))
                })
            })
            .collect()
    }
}

/// A manifest as served by the registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub media_type: String,
    pub body: Bytes,
}

impl FetchedManifest {
    pub fn parse(&self) -> RegistryResult<ImageManifest> {
        ImageManifest::parse(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(b: &[u8]) -> String {
        ContentHash::compute(b).to_digest()
    }

    #[test]
    fn parses_oci_manifest_and_lists_blobs() {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_V1,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": digest(b"c"), "size": 1},
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": digest(b"l1"), "size": 2},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": digest(b"l2"), "size": 2}
            ]
        });
        let manifest = ImageManifest::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(manifest.accepted_media_type(), Some(OCI_MANIFEST_V1));
        let blobs = manifest.blob_digests().unwrap();
        assert_eq!(blobs.len(), 3);
        assert_eq!(blobs[0], ContentHash::compute(b"c"));
    }

    #[test]
    fn unknown_or_missing_media_type_is_not_accepted() {
        let manifest = ImageManifest::parse(br#"{"schemaVersion": 2}"#).unwrap();
        assert_eq!(manifest.accepted_media_type(), None);

        let manifest = ImageManifest::parse(
            br#"{"mediaType": "application/vnd.oci.image.index.v1+json"}"#,
        )
        .unwrap();
        assert_eq!(manifest.accepted_media_type(), None);
    }

    #[test]
    fn bad_layer_digest_is_invalid_manifest() {
        let manifest = ImageManifest::parse(
            br#"{"mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                 "layers": [{"digest": "md5:abc"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            manifest.blob_digests(),
            Err(RegistryError::InvalidManifest(_))
        ));
    }
}
