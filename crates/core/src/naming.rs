//! Object keys and archive entry names.

/// Archive entry holding the image manifest.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Directory prefix of blob entries inside an image archive.
pub const BLOB_ENTRY_PREFIX: &str = "blobs/sha256/";

/// Prefix under which imported files are written.
pub const MIRROR_PREFIX: &str = "mirror";

/// Archive filename for an artefact: `<artefactId>.tar.gz`.
pub fn archive_file_name(artefact_id: &str) -> String {
    format!("{artefact_id}.tar.gz")
}

/// Key of a published (or staged) archive: `<exportId>/<artefactId>.tar.gz`.
pub fn export_key(export_id: &str, artefact_id: &str) -> String {
    format!("{export_id}/{}", archive_file_name(artefact_id))
}

/// Archive entry name for a blob digest given as 64 lowercase hex characters.
pub fn blob_entry_name(hex: &str) -> String {
    format!("{BLOB_ENTRY_PREFIX}{hex}")
}

/// Destination of an imported file: `mirror/<mirroredModelId>/<fileId>`.
///
/// `file_path` is the source storage path; only its last segment is kept.
pub fn mirror_file_path(mirrored_model_id: &str, file_path: &str) -> String {
    let file_id = file_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(file_path);
    format!("{MIRROR_PREFIX}/{mirrored_model_id}/{file_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_key_layout() {
        assert_eq!(archive_file_name("file-1"), "file-1.tar.gz");
        assert_eq!(export_key("exp-9", "file-1"), "exp-9/file-1.tar.gz");
    }

    #[test]
    fn mirror_path_keeps_last_segment() {
        assert_eq!(
            mirror_file_path("dst", "beta/model-src/file-1"),
            "mirror/dst/file-1"
        );
        assert_eq!(mirror_file_path("dst", "file-1"), "mirror/dst/file-1");
        assert_eq!(mirror_file_path("dst", "a/file-1/"), "mirror/dst/file-1");
    }

    #[test]
    fn blob_entry_layout() {
        let hex = "a".repeat(64);
        assert_eq!(blob_entry_name(&hex), format!("blobs/sha256/{hex}"));
    }
}
