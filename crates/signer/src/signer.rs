//! Archive digests and detached signatures.
//!
//! The signed message is the digest string (`sha256:<hex>`) of the complete
//! archive, so a signature can be checked against an independently recomputed
//! digest of the same bytes.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use ferry_core::{ContentHash, ExportSignature};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer for digest computation (256 KiB).
const DIGEST_BUFFER_SIZE: usize = 256 * 1024;

/// Single-pass SHA-256 over an async reader.
pub async fn digest_reader<R>(reader: &mut R) -> SignerResult<ContentHash>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = ContentHash::hasher();
    let mut buf = vec![0u8; DIGEST_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// A detached signature over an archive digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureSet {
    pub key_name: String,
    /// Base64 Ed25519 signature over the digest string.
    pub signature: String,
    pub digest: ContentHash,
}

impl From<SignatureSet> for ExportSignature {
    fn from(set: SignatureSet) -> Self {
        ExportSignature {
            digest: set.digest,
            signature: set.signature,
            key_name: set.key_name,
        }
    }
}

/// Something that can sign archive digests.
pub trait Signer: Send + Sync {
    /// Sign a digest.
    fn sign(&self, digest: &ContentHash) -> SignatureSet;

    /// Get the key name.
    fn key_name(&self) -> &str;
}

/// Ed25519 signer for export archives.
pub struct ArchiveSigner {
    keypair: KeyPair,
}

impl ArchiveSigner {
    /// Create a new signer from a key pair.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a `name:base64` secret key string.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_key(s)?))
    }

    /// Generate a new signer with a random key.
    pub fn generate(key_name: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_name))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// The public key in `name:base64` form.
    pub fn public_key_string(&self) -> String {
        self.keypair.public_key_string()
    }
}

impl Signer for ArchiveSigner {
    fn sign(&self, digest: &ContentHash) -> SignatureSet {
        let message = digest.to_digest();
        let sig = self.keypair.secret.signing_key().sign(message.as_bytes());
        SignatureSet {
            key_name: self.keypair.name.clone(),
            signature: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
            digest: *digest,
        }
    }

    fn key_name(&self) -> &str {
        &self.keypair.name
    }
}

impl std::fmt::Debug for ArchiveSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSigner")
            .field("key_name", &self.keypair.name)
            .finish_non_exhaustive()
    }
}

/// Verify a base64 signature over `digest`.
pub fn verify_signature(
    digest: &ContentHash,
    signature: &str,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature)
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", b.len()))
    })?;

    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(digest.to_digest().as_bytes(), &signature)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Verify an envelope signature against the actual archive digest and a set
/// of trusted keys, matched by key name.
pub fn verify_export_signature(
    signature: &ExportSignature,
    actual_digest: &ContentHash,
    trusted_keys: &[(String, PublicKey)],
) -> SignerResult<()> {
    if &signature.digest != actual_digest {
        return Err(SignerError::DigestMismatch {
            expected: signature.digest.to_digest(),
            actual: actual_digest.to_digest(),
        });
    }
    let (_, public_key) = trusted_keys
        .iter()
        .find(|(name, _)| name == &signature.key_name)
        .ok_or_else(|| SignerError::UnknownKey(signature.key_name.clone()))?;
    verify_signature(actual_digest, &signature.signature, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_digest_reader_matches_one_shot() {
        let data: Vec<u8> = (0..(DIGEST_BUFFER_SIZE * 2 + 5)).map(|i| i as u8).collect();
        let digest = digest_reader(&mut data.as_slice()).await.unwrap();
        assert_eq!(digest, ContentHash::compute(&data));
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = ArchiveSigner::generate("ferry-1");
        let digest = ContentHash::compute(b"archive bytes");

        let set = signer.sign(&digest);
        assert_eq!(set.key_name, "ferry-1");
        assert_eq!(set.digest, digest);

        verify_signature(&digest, &set.signature, signer.public_key()).unwrap();
    }

    #[test]
    fn test_verify_with_wrong_key_or_digest() {
        let signer1 = ArchiveSigner::generate("key-1");
        let signer2 = ArchiveSigner::generate("key-2");
        let digest = ContentHash::compute(b"archive bytes");
        let set = signer1.sign(&digest);

        assert!(verify_signature(&digest, &set.signature, signer2.public_key()).is_err());
        let other = ContentHash::compute(b"tampered");
        assert!(verify_signature(&other, &set.signature, signer1.public_key()).is_err());
    }

    #[test]
    fn test_verify_export_signature_with_trusted_keys() {
        let signer = ArchiveSigner::generate("trusted-1");
        let digest = ContentHash::compute(b"archive");
        let envelope_sig: ExportSignature = signer.sign(&digest).into();

        let trusted = vec![("trusted-1".to_string(), signer.public_key().clone())];
        verify_export_signature(&envelope_sig, &digest, &trusted).unwrap();

        let err = verify_export_signature(&envelope_sig, &ContentHash::compute(b"x"), &trusted)
            .unwrap_err();
        assert!(matches!(err, SignerError::DigestMismatch { .. }));

        let err = verify_export_signature(&envelope_sig, &digest, &[]).unwrap_err();
        assert!(matches!(err, SignerError::UnknownKey(_)));
    }
}
