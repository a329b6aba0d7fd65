//! The export metadata envelope.
//!
//! The envelope travels as object-storage metadata on the published archive,
//! never inside it. A peer reads it before touching the archive body to decide
//! which importer can accept the bundle.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::package::DistributionPackageName;
use crate::EXPORT_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Object metadata keys.
pub mod keys {
    pub const SCHEMA_VERSION: &str = "schemaVersion";
    pub const SOURCE_MODEL_ID: &str = "sourceModelId";
    pub const MIRRORED_MODEL_ID: &str = "mirroredModelId";
    pub const EXPORTER: &str = "exporter";
    pub const EXPORT_ID: &str = "exportId";
    pub const IMPORT_KIND: &str = "importKind";
    pub const FILE_PATH: &str = "filePath";
    pub const DISTRIBUTION_PACKAGE_NAME: &str = "distributionPackageName";
    pub const DIGEST: &str = "digest";
    pub const SIGNATURE: &str = "signature";
    pub const SIGNATURE_KEY_NAME: &str = "signatureKeyName";
}

/// Which importer accepts a bundle, with its kind-specific field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "importKind", rename_all_fields = "camelCase")]
pub enum ImportKind {
    File { file_path: String },
    Image { distribution_package_name: DistributionPackageName },
}

impl ImportKind {
    pub fn name(&self) -> ImportKindName {
        match self {
            Self::File { .. } => ImportKindName::File,
            Self::Image { .. } => ImportKindName::Image,
        }
    }
}

/// Kind discriminant without payload, used for dispatch, logging and metrics labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportKindName {
    File,
    Image,
}

impl ImportKindName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "File",
            Self::Image => "Image",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("file") {
            Ok(Self::File)
        } else if s.eq_ignore_ascii_case("image") {
            Ok(Self::Image)
        } else {
            Err(Error::InvalidMetadata(format!("unknown importKind: {s}")))
        }
    }
}

impl fmt::Display for ImportKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detached signature over the complete archive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSignature {
    pub digest: ContentHash,
    /// Base64 Ed25519 signature over the digest string.
    pub signature: String,
    #[serde(rename = "signatureKeyName")]
    pub key_name: String,
}

/// Envelope describing one exported artefact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub schema_version: u32,
    pub source_model_id: String,
    pub mirrored_model_id: String,
    /// Identity of the acting principal.
    pub exporter: String,
    pub export_id: String,
    #[serde(flatten)]
    kind: ImportKind,
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    signature: Option<ExportSignature>,
}

impl ExportMetadata {
    pub fn new(
        source_model_id: impl Into<String>,
        mirrored_model_id: impl Into<String>,
        exporter: impl Into<String>,
        export_id: impl Into<String>,
        kind: ImportKind,
    ) -> Self {
        Self {
            schema_version: EXPORT_SCHEMA_VERSION,
            source_model_id: source_model_id.into(),
            mirrored_model_id: mirrored_model_id.into(),
            exporter: exporter.into(),
            export_id: export_id.into(),
            kind,
            signature: None,
        }
    }

    /// The import kind fixed at construction.
    pub fn kind(&self) -> &ImportKind {
        &self.kind
    }

    pub fn kind_name(&self) -> ImportKindName {
        self.kind.name()
    }

    pub fn signature(&self) -> Option<&ExportSignature> {
        self.signature.as_ref()
    }

    /// Attach the archive signature.
    pub fn with_signature(mut self, signature: ExportSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Flatten into object-storage metadata.
    pub fn to_object_metadata(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(keys::SCHEMA_VERSION.to_string(), self.schema_version.to_string());
        map.insert(keys::SOURCE_MODEL_ID.to_string(), self.source_model_id.clone());
        map.insert(keys::MIRRORED_MODEL_ID.to_string(), self.mirrored_model_id.clone());
        map.insert(keys::EXPORTER.to_string(), self.exporter.clone());
        map.insert(keys::EXPORT_ID.to_string(), self.export_id.clone());
        map.insert(keys::IMPORT_KIND.to_string(), self.kind.name().to_string());
        match &self.kind {
            ImportKind::File { file_path } => {
                map.insert(keys::FILE_PATH.to_string(), file_path.clone());
            }
            ImportKind::Image {
                distribution_package_name,
            } => {
                map.insert(
                    keys::DISTRIBUTION_PACKAGE_NAME.to_string(),
                    distribution_package_name.to_string(),
                );
            }
        }
        if let Some(sig) = &self.signature {
            map.insert(keys::DIGEST.to_string(), sig.digest.to_digest());
            map.insert(keys::SIGNATURE.to_string(), sig.signature.clone());
            map.insert(keys::SIGNATURE_KEY_NAME.to_string(), sig.key_name.clone());
        }
        map
    }

    /// Parse from object-storage metadata. Keys match case-insensitively,
    /// since S3 lowercases user metadata keys.
    pub fn from_object_metadata(map: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &'static str| -> Option<&str> {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        };
        let require = |key: &'static str| get(key).ok_or(Error::MissingMetadataField(key));

        let raw_version = require(keys::SCHEMA_VERSION)?;
        let schema_version: u32 = raw_version.trim().parse().map_err(|_| {
            Error::InvalidMetadata(format!("schemaVersion is not an integer: {raw_version}"))
        })?;
        if schema_version != EXPORT_SCHEMA_VERSION {
            return Err(Error::UnsupportedSchemaVersion(schema_version));
        }

        let kind = match ImportKindName::parse(require(keys::IMPORT_KIND)?)? {
            ImportKindName::File => ImportKind::File {
                file_path: require(keys::FILE_PATH)?.to_string(),
            },
            ImportKindName::Image => ImportKind::Image {
                distribution_package_name: DistributionPackageName::parse(require(
                    keys::DISTRIBUTION_PACKAGE_NAME,
                )?)?,
            },
        };

        let signature = match (
            get(keys::DIGEST),
            get(keys::SIGNATURE),
            get(keys::SIGNATURE_KEY_NAME),
        ) {
            (None, None, None) => None,
            (Some(digest), Some(signature), Some(key_name)) => Some(ExportSignature {
                digest: ContentHash::from_digest(digest)?,
                signature: signature.to_string(),
                key_name: key_name.to_string(),
            }),
            _ => {
                return Err(Error::InvalidMetadata(
                    "signature fields must be all present or all absent".to_string(),
                ));
            }
        };

        Ok(Self {
            schema_version,
            source_model_id: require(keys::SOURCE_MODEL_ID)?.to_string(),
            mirrored_model_id: require(keys::MIRRORED_MODEL_ID)?.to_string(),
            exporter: require(keys::EXPORTER)?.to_string(),
            export_id: require(keys::EXPORT_ID)?.to_string(),
            kind,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_metadata() -> ExportMetadata {
        ExportMetadata::new(
            "model-src",
            "model-dst",
            "alice",
            "exp-1",
            ImportKind::File {
                file_path: "model-src/file-123".to_string(),
            },
        )
    }

    #[test]
    fn object_metadata_has_documented_keys() {
        let map = file_metadata().to_object_metadata();
        assert_eq!(map.get("schemaVersion").map(String::as_str), Some("1"));
        assert_eq!(map.get("importKind").map(String::as_str), Some("File"));
        assert_eq!(
            map.get("filePath").map(String::as_str),
            Some("model-src/file-123")
        );
        assert!(!map.contains_key("distributionPackageName"));
        assert!(!map.contains_key("signature"));
    }

    #[test]
    fn parse_is_case_insensitive() {
        let lowered: BTreeMap<String, String> = file_metadata()
            .to_object_metadata()
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let parsed = ExportMetadata::from_object_metadata(&lowered).unwrap();
        assert_eq!(parsed, file_metadata());
    }

    #[test]
    fn image_with_signature_survives_object_metadata() {
        let name = DistributionPackageName::parse("localhost:5000/model-dst/app:v1").unwrap();
        let metadata = ExportMetadata::new(
            "model-src",
            "model-dst",
            "alice",
            "exp-2",
            ImportKind::Image {
                distribution_package_name: name,
            },
        )
        .with_signature(ExportSignature {
            digest: ContentHash::compute(b"archive"),
            signature: "c2ln".to_string(),
            key_name: "ferry-1".to_string(),
        });

        let parsed = ExportMetadata::from_object_metadata(&metadata.to_object_metadata()).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.kind_name(), ImportKindName::Image);
    }

    #[test]
    fn missing_field_is_reported() {
        let mut map = file_metadata().to_object_metadata();
        map.remove("filePath");
        let err = ExportMetadata::from_object_metadata(&map).unwrap_err();
        assert!(matches!(err, Error::MissingMetadataField("filePath")));
    }

    #[test]
    fn unsupported_schema_version_is_rejected() {
        let mut map = file_metadata().to_object_metadata();
        map.insert("schemaVersion".to_string(), "7".to_string());
        let err = ExportMetadata::from_object_metadata(&map).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSchemaVersion(7)));
    }

    #[test]
    fn partial_signature_is_rejected() {
        let mut map = file_metadata().to_object_metadata();
        map.insert("signature".to_string(), "abc".to_string());
        assert!(ExportMetadata::from_object_metadata(&map).is_err());
    }

    #[test]
    fn json_form_is_flat() {
        let value = serde_json::to_value(file_metadata()).unwrap();
        assert_eq!(value["importKind"], "File");
        assert_eq!(value["filePath"], "model-src/file-123");
        assert_eq!(value["mirroredModelId"], "model-dst");
        assert!(value.get("signature").is_none());
    }
}
