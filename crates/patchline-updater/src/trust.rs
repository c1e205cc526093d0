//! Trusted key material.
//!
//! A [`TrustContext`] is built once from a local, trusted source (the
//! updater configuration) and shared read-only by everything downstream.
//! It holds two independent capabilities:
//! - the Ed25519 public key every file signature is checked against
//! - the pre-shared ChaCha20 key and IV that protect payload confidentiality
//!
//! Nothing fetched from the network can change either of them.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::config::TrustConfig;
use crate::error::UpdateError;

/// Length of the symmetric payload key in bytes.
pub const BLOB_KEY_LEN: usize = 32;

/// Length of the symmetric payload IV in bytes.
pub const BLOB_IV_LEN: usize = 12;

/// Length of a SHA-512 digest in bytes.
pub const DIGEST_LEN: usize = 64;

/// Immutable trust anchor for signature checks and payload decryption.
#[derive(Clone)]
pub struct TrustContext {
    public_key: VerifyingKey,
    blob_key: Zeroizing<[u8; BLOB_KEY_LEN]>,
    blob_iv: Zeroizing<[u8; BLOB_IV_LEN]>,
}

impl TrustContext {
    /// Create a context from already decoded key material.
    pub fn new(
        public_key: VerifyingKey,
        blob_key: [u8; BLOB_KEY_LEN],
        blob_iv: [u8; BLOB_IV_LEN],
    ) -> Self {
        Self {
            public_key,
            blob_key: Zeroizing::new(blob_key),
            blob_iv: Zeroizing::new(blob_iv),
        }
    }

    /// Build the context from the `[trust]` section of the configuration.
    pub fn from_config(config: &TrustConfig) -> Result<Self, UpdateError> {
        let public_key = parse_verifying_key(&config.public_key)?;
        let blob_key = decode_hex_array::<BLOB_KEY_LEN>(&config.blob_key, "blob_key")?;
        let blob_iv = decode_hex_array::<BLOB_IV_LEN>(&config.blob_iv, "blob_iv")?;
        Ok(Self::new(public_key, blob_key, blob_iv))
    }

    /// The trusted verification key.
    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Verify `signature` over a SHA-512 digest.
    pub fn verify_digest(
        &self,
        digest: &[u8; DIGEST_LEN],
        signature: &Signature,
    ) -> Result<(), UpdateError> {
        self.public_key.verify_strict(digest, signature)?;
        Ok(())
    }

    /// Cipher for the legacy `Blob` element, keyed by the pre-shared key and IV.
    pub fn blob_cipher(&self) -> PayloadCipher {
        PayloadCipher::new(&self.blob_key, &self.blob_iv)
    }

    /// Cipher for one per-file payload.
    ///
    /// The nonce is the first 12 bytes of SHA-512(IV || relative path), so
    /// each file gets its own keystream under the shared key.
    pub fn file_cipher(&self, relative_path: &str) -> PayloadCipher {
        let derived = Sha512::new()
            .chain_update(self.blob_iv.as_slice())
            .chain_update(relative_path.as_bytes())
            .finalize();
        let mut nonce = [0u8; BLOB_IV_LEN];
        nonce.copy_from_slice(&derived[..BLOB_IV_LEN]);
        PayloadCipher::new(&self.blob_key, &nonce)
    }
}

impl std::fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustContext")
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Streaming symmetric transform.
///
/// ChaCha20 is its own inverse, so the same type encrypts on the publisher
/// side and decrypts on the client side.
pub struct PayloadCipher {
    inner: ChaCha20,
}

impl PayloadCipher {
    /// Create a cipher from a 32-byte key and 12-byte IV.
    pub fn new(key: &[u8; BLOB_KEY_LEN], iv: &[u8; BLOB_IV_LEN]) -> Self {
        Self {
            inner: ChaCha20::new(Key::from_slice(key), Nonce::from_slice(iv)),
        }
    }

    /// Transform `buf` in place, advancing the keystream.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PayloadCipher")
    }
}

/// Sign a SHA-512 digest. Publisher only.
pub fn sign_digest(signing_key: &SigningKey, digest: &[u8; DIGEST_LEN]) -> Signature {
    signing_key.sign(digest)
}

/// Parse an Ed25519 public key.
///
/// Supports formats:
/// - "ed25519:<hex_encoded_32_bytes>"
/// - "ed25519:<base64_encoded_32_bytes>"
pub fn parse_verifying_key(s: &str) -> Result<VerifyingKey, UpdateError> {
    let key_bytes = decode_ed25519_material(s)?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| UpdateError::ConfigError(format!("invalid Ed25519 public key: {}", e)))
}

/// Parse an Ed25519 signing key seed in the same formats as
/// [`parse_verifying_key`].
pub fn parse_signing_key(s: &str) -> Result<SigningKey, UpdateError> {
    let seed = Zeroizing::new(decode_ed25519_material(s)?);
    Ok(SigningKey::from_bytes(&seed))
}

fn decode_ed25519_material(s: &str) -> Result<[u8; 32], UpdateError> {
    let Some(encoded) = s.trim().strip_prefix("ed25519:") else {
        return Err(UpdateError::ConfigError(
            "key must start with 'ed25519:'".to_string(),
        ));
    };

    let key_data = match hex::decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => STANDARD.decode(encoded).map_err(|e| {
            UpdateError::ConfigError(format!("invalid key encoding: {}", e))
        })?,
    };

    key_data.try_into().map_err(|_| {
        UpdateError::ConfigError("Ed25519 key must be 32 bytes".to_string())
    })
}

/// Decode a fixed-length hex value from configuration.
pub fn decode_hex_array<const N: usize>(s: &str, name: &str) -> Result<[u8; N], UpdateError> {
    let bytes = Zeroizing::new(
        hex::decode(s.trim())
            .map_err(|e| UpdateError::ConfigError(format!("{} is not valid hex: {}", name, e)))?,
    );
    let mut out = [0u8; N];
    if bytes.len() != N {
        return Err(UpdateError::ConfigError(format!(
            "{} must be {} bytes, got {}",
            name,
            N,
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}
