pub mod env;
pub mod fixtures;
pub mod registry;
pub mod storage;

#[allow(unused_imports)]
pub use env::{
    CONSUMER, MIRRORED_MODEL, OWNER, REGISTRY_DOMAIN, SOURCE_MODEL, STRANGER, SeededImage,
    TestEnv, clean_scan, oci_manifest,
};
#[allow(unused_imports)]
pub use fixtures::{
    append_dir, append_file, append_symlink, gzip_tar, seeded_bytes, sha256_hash,
};
#[allow(unused_imports)]
pub use registry::FakeRegistry;
#[allow(unused_imports)]
pub use storage::CountingStore;
