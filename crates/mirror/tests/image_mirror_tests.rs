//! Image export/import through the coordinator and a fake registry.

mod common;

use common::*;
use ferry_core::{ContentHash, DistributionPackageName, ExportMetadata, ImportKind};
use ferry_core::naming::blob_entry_name;
use ferry_mirror::{
    ArchiveWriter, ExportOutcome, ExportTarget, FileImporter, ImageImporter, ImportDetail,
    MirrorError,
};
use ferry_registry::{DOCKER_MANIFEST_V2, OCI_MANIFEST_V1};
use std::io::Cursor;

const SOURCE_REPO: &str = "model-src/app";
const MIRRORED_REPO: &str = "model-dst/app";

fn image_target(release: &str, image_name: &str, tag: &str) -> ExportTarget {
    ExportTarget::Image {
        model_id: SOURCE_MODEL.to_string(),
        release: release.to_string(),
        image_name: image_name.to_string(),
        tag: tag.to_string(),
    }
}

async fn seed_app(env: &TestEnv) -> SeededImage {
    let base = seeded_bytes(1, 200 * 1024);
    let app = seeded_bytes(2, 70 * 1024);
    env.add_image(
        "1.0.0",
        "app",
        "v1",
        br#"{"architecture":"amd64"}"#,
        &[&base[..], &app[..]],
    )
    .await
}

fn image_metadata(package: &str) -> ExportMetadata {
    ExportMetadata::new(
        SOURCE_MODEL,
        MIRRORED_MODEL,
        OWNER,
        "exp-image",
        ImportKind::Image {
            distribution_package_name: DistributionPackageName::parse(package).unwrap(),
        },
    )
}

/// Build an image archive with entries in exactly the given order.
async fn image_archive(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut writer = ArchiveWriter::new(Vec::new());
    for (name, data) in entries {
        writer.append_bytes(name, data).await.unwrap();
    }
    writer.finish().await.unwrap()
}

fn blob_entry(data: &[u8]) -> (String, Vec<u8>) {
    (
        blob_entry_name(&ContentHash::compute(data).to_hex()),
        data.to_vec(),
    )
}

#[tokio::test]
async fn test_image_export_then_import() {
    let env = TestEnv::new().await;
    let image = seed_app(&env).await;
    let coordinator = env.coordinator();

    // Consumers may pull, so they may export images.
    let outcome = coordinator
        .export(CONSUMER, image_target("1.0.0", "app", "v1"))
        .await
        .unwrap();
    let ExportOutcome::Committed { key, metadata, .. } = outcome else {
        panic!("expected a committed export");
    };
    assert!(key.ends_with("/app.tar.gz"), "{key}");
    match metadata.kind() {
        ImportKind::Image {
            distribution_package_name,
        } => assert_eq!(
            distribution_package_name.to_string(),
            "registry.test/model-dst/app:v1"
        ),
        other => panic!("unexpected kind {other:?}"),
    }

    let imported = coordinator.import(&key).await.unwrap();
    assert_eq!(imported.destination, "registry.test/model-dst/app:v1");
    assert_eq!(imported.source, "model-src/app:v1");
    assert_eq!(
        imported.detail,
        ImportDetail::Image {
            blobs_uploaded: 3,
            blobs_skipped: 0,
            media_type: OCI_MANIFEST_V1.to_string(),
        }
    );

    let pushed = env.registry.manifest(MIRRORED_REPO, "v1").unwrap();
    assert_eq!(pushed.body.as_ref(), image.manifest.as_slice());
    assert_eq!(pushed.media_type, OCI_MANIFEST_V1);
    for digest in image.digests() {
        assert_eq!(
            env.registry.blob(MIRRORED_REPO, &digest),
            env.registry.blob(SOURCE_REPO, &digest),
            "blob {digest} differs"
        );
    }
    assert!(env.registry.missing_at_manifest_push().is_empty());
}

#[tokio::test]
async fn test_image_import_is_idempotent() {
    let env = TestEnv::new().await;
    seed_app(&env).await;
    let coordinator = env.coordinator();
    let ExportOutcome::Committed { key, .. } = coordinator
        .export(OWNER, image_target("1.0.0", "app", "v1"))
        .await
        .unwrap()
    else {
        panic!("expected a committed export");
    };

    coordinator.import(&key).await.unwrap();
    assert_eq!(env.registry.put_blob_calls(), 3);
    let probes_after_first = env.registry.blob_exists_calls();

    let second = coordinator.import(&key).await.unwrap();
    assert_eq!(
        second.detail,
        ImportDetail::Image {
            blobs_uploaded: 0,
            blobs_skipped: 3,
            media_type: OCI_MANIFEST_V1.to_string(),
        }
    );
    assert_eq!(env.registry.put_blob_calls(), 3);
    assert_eq!(env.registry.blob_exists_calls(), probes_after_first + 3);
    assert_eq!(env.registry.blob_count(MIRRORED_REPO), 3);
}

#[tokio::test]
async fn test_manifest_before_blobs_commits_after_blobs() {
    let env = TestEnv::new().await;
    let config = br#"{"os":"linux"}"#.to_vec();
    let layer = seeded_bytes(9, 50 * 1024).to_vec();
    let manifest = oci_manifest(
        (ContentHash::compute(&config), config.len()),
        &[(ContentHash::compute(&layer), layer.len())],
    );
    let archive = image_archive(&[
        ("manifest.json".to_string(), manifest.clone()),
        blob_entry(&config),
        blob_entry(&layer),
    ])
    .await;

    let outcome = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v2"), Cursor::new(archive))
        .await
        .unwrap();
    assert!(matches!(
        outcome.detail,
        ImportDetail::Image {
            blobs_uploaded: 2,
            ..
        }
    ));
    assert_eq!(env.registry.put_manifest_calls(), 1);
    assert!(env.registry.missing_at_manifest_push().is_empty());
    assert_eq!(
        env.registry.manifest(MIRRORED_REPO, "v2").unwrap().body.as_ref(),
        manifest.as_slice()
    );
}

#[tokio::test]
async fn test_manifest_with_missing_blob_is_not_committed() {
    let env = TestEnv::new().await;
    let config = br#"{"os":"linux"}"#.to_vec();
    let layer = seeded_bytes(4, 1024).to_vec();
    let manifest = oci_manifest(
        (ContentHash::compute(&config), config.len()),
        &[(ContentHash::compute(&layer), layer.len())],
    );
    let archive = image_archive(&[
        blob_entry(&config),
        ("manifest.json".to_string(), manifest),
    ])
    .await;

    let err = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");
    assert_eq!(
        err.context().get("digest").map(String::as_str),
        Some(ContentHash::compute(&layer).to_digest().as_str())
    );
    assert_eq!(env.registry.put_manifest_calls(), 0);
}

#[tokio::test]
async fn test_blob_already_in_registry_satisfies_manifest() {
    let env = TestEnv::new().await;
    let config = br#"{"os":"linux"}"#.to_vec();
    let layer = seeded_bytes(4, 1024).to_vec();
    env.registry.seed_blob(MIRRORED_REPO, &layer);
    let manifest = oci_manifest(
        (ContentHash::compute(&config), config.len()),
        &[(ContentHash::compute(&layer), layer.len())],
    );
    let archive = image_archive(&[
        blob_entry(&config),
        ("manifest.json".to_string(), manifest),
    ])
    .await;

    env.coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap();
    assert_eq!(env.registry.put_blob_calls(), 1);
    assert_eq!(env.registry.put_manifest_calls(), 1);
}

#[tokio::test]
async fn test_archive_without_manifest_fails() {
    let env = TestEnv::new().await;
    let archive = image_archive(&[blob_entry(b"lonely layer")]).await;

    let err = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");
    assert!(err.message().contains("no manifest"), "{err}");
}

#[tokio::test]
async fn test_manifest_without_accepted_media_type_fails() {
    let env = TestEnv::new().await;
    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [],
    }))
    .unwrap();
    let archive = image_archive(&[("manifest.json".to_string(), manifest)]).await;

    let err = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");
    assert_eq!(env.registry.put_manifest_calls(), 0);
}

#[tokio::test]
async fn test_unrecognized_entries_are_skipped() {
    let env = TestEnv::new().await;
    let config = br#"{}"#.to_vec();
    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_V2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": ContentHash::compute(&config).to_digest(),
            "size": config.len(),
        },
        "layers": [],
    }))
    .unwrap();
    let archive = image_archive(&[
        ("README.txt".to_string(), b"not part of the image".to_vec()),
        blob_entry(&config),
        ("blobs/sha256/not-a-digest".to_string(), b"junk".to_vec()),
        ("manifest.json".to_string(), manifest),
    ])
    .await;

    let outcome = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap();
    assert_eq!(
        outcome.detail,
        ImportDetail::Image {
            blobs_uploaded: 1,
            blobs_skipped: 0,
            media_type: DOCKER_MANIFEST_V2.to_string(),
        }
    );
}

#[tokio::test]
async fn test_non_file_entries_are_skipped() {
    let env = TestEnv::new().await;
    let config = br#"{"os":"linux"}"#.to_vec();
    let manifest = oci_manifest((ContentHash::compute(&config), config.len()), &[]);
    let (blob_name, _) = blob_entry(&config);
    let archive = gzip_tar(|builder| {
        append_dir(builder, "blobs/");
        append_dir(builder, "blobs/sha256/");
        append_file(builder, &blob_name, &config);
        // Same name as the manifest, but a link: skipped, not buffered.
        append_symlink(builder, "manifest.json", "blobs/sha256/elsewhere");
        append_file(builder, "manifest.json", &manifest);
    })
    .await;

    let outcome = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap();
    assert_eq!(
        outcome.detail,
        ImportDetail::Image {
            blobs_uploaded: 1,
            blobs_skipped: 0,
            media_type: OCI_MANIFEST_V1.to_string(),
        }
    );
    assert_eq!(
        env.registry.manifest(MIRRORED_REPO, "v1").unwrap().body.as_ref(),
        manifest.as_slice()
    );
}

#[tokio::test]
async fn test_registry_rejecting_a_blob_aborts_import() {
    let env = TestEnv::new().await;
    let config = br#"{"os":"linux"}"#.to_vec();
    let manifest = oci_manifest((ContentHash::compute(&config), config.len()), &[]);
    // Named for the config digest but carrying other bytes.
    let (forged_name, _) = blob_entry(&config);
    let archive = image_archive(&[
        (forged_name, b"tampered".to_vec()),
        ("manifest.json".to_string(), manifest),
    ])
    .await;

    let err = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap_err();
    assert!(!err.is_domain(), "{err:?}");
    assert!(err.message().contains("failed to upload blob"), "{err}");
    assert_eq!(env.registry.put_blob_calls(), 1);
    assert_eq!(env.registry.put_manifest_calls(), 0);
    assert_eq!(env.registry.blob_count(MIRRORED_REPO), 0);
}

#[tokio::test]
async fn test_importer_kind_mismatch_fails_at_construction() {
    let env = TestEnv::new().await;

    let err = FileImporter::new(
        env.context(),
        image_metadata("registry.test/model-dst/app:v1"),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");
    assert!(err.message().contains("Image"), "{err}");

    let file = ExportMetadata::new(
        SOURCE_MODEL,
        MIRRORED_MODEL,
        OWNER,
        "exp-file",
        ImportKind::File {
            file_path: "model-src/a".to_string(),
        },
    );
    let err = ImageImporter::new(env.context(), file).err().unwrap();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");
}

#[tokio::test]
async fn test_duplicate_manifest_entries_fail() {
    let env = TestEnv::new().await;
    let config = br#"{}"#.to_vec();
    let manifest = oci_manifest((ContentHash::compute(&config), config.len()), &[]);
    let archive = image_archive(&[
        blob_entry(&config),
        ("manifest.json".to_string(), manifest.clone()),
        ("manifest.json".to_string(), manifest),
    ])
    .await;

    let err = env
        .coordinator()
        .import_from_reader(image_metadata("registry.test/model-dst/app:v1"), Cursor::new(archive))
        .await
        .unwrap_err();
    assert!(err.message().contains("multiple manifests"), "{err}");
    assert_eq!(env.registry.put_manifest_calls(), 0);
}

#[tokio::test]
async fn test_package_outside_mirrored_model_is_rejected() {
    let env = TestEnv::new().await;
    let archive = image_archive(&[]).await;

    let err = env
        .coordinator()
        .import_from_reader(
            image_metadata("registry.test/other-model/app:v1"),
            Cursor::new(archive),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::BadRequest { .. }), "{err:?}");
}

#[tokio::test]
async fn test_image_export_resolution_errors() {
    let env = TestEnv::new().await;
    seed_app(&env).await;
    let coordinator = env.coordinator();

    let err = coordinator
        .export(OWNER, image_target("9.9.9", "app", "v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::NotFound { .. }), "{err:?}");

    let err = coordinator
        .export(OWNER, image_target("1.0.0", "app", "v2"))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Internal { .. }), "{err:?}");

    let err = coordinator
        .export(STRANGER, image_target("1.0.0", "app", "v1"))
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::Forbidden { .. }), "{err:?}");
    assert_eq!(
        err.context().get("action").map(String::as_str),
        Some("pull_image")
    );
    assert_eq!(env.archive_writes(), 0);
}
