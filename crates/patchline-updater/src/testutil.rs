//! Fixtures shared by the unit tests.

use std::path::Path;

use ed25519_dalek::SigningKey;

use crate::client::UpdateClient;
use crate::download::Downloader;
use crate::payload::encode_payload;
use crate::trust::TrustContext;

pub(crate) const BLOB_KEY: [u8; 32] = [0x11; 32];
pub(crate) const BLOB_IV: [u8; 12] = [0x22; 12];

pub(crate) fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[0x42; 32])
}

pub(crate) fn trust() -> TrustContext {
    TrustContext::new(signing_key().verifying_key(), BLOB_KEY, BLOB_IV)
}

pub(crate) fn client(staging_root: &Path) -> UpdateClient {
    UpdateClient::new(Downloader::new().unwrap(), trust(), staging_root.to_path_buf())
}

/// Encode `content` the way the publisher stores the payload for `rel`.
pub(crate) fn encoded_payload(rel: &str, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_payload(trust().file_cipher(rel), content, &mut out).unwrap();
    out
}
