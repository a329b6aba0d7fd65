//! OCI distribution client used to mirror container images.

pub mod auth;
pub mod client;
pub mod error;
pub mod manifest;

pub use auth::{AccessScope, CredentialProvider, ScopeKind, StaticCredentials};
pub use client::{
    BlobStream, ImageRepository, Registry, RegistryClient, RepositoryClient, UploadSession,
};
pub use error::{RegistryError, RegistryResult};
pub use manifest::{
    ACCEPTED_MANIFEST_TYPES, DOCKER_MANIFEST_V2, Descriptor, FetchedManifest, ImageManifest,
    OCI_MANIFEST_V1,
};
