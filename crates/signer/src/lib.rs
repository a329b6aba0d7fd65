//! Archive signing for ferry exports.
//!
//! This crate provides:
//! - Ed25519 key generation and `name:base64` key encoding
//! - Streaming SHA-256 digests over archives
//! - Detached signatures over digests, and their verification

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{
    ArchiveSigner, SignatureSet, Signer, digest_reader, verify_export_signature,
    verify_signature,
};
