//! Host key fingerprints

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash algorithm used to render a host key fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintHash {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

/// Digest of the SSH wire-format public key blob
pub fn digest(hash: FingerprintHash, key_blob: &[u8]) -> Vec<u8> {
    match hash {
        FingerprintHash::Md5 => Md5::digest(key_blob).to_vec(),
        FingerprintHash::Sha1 => Sha1::digest(key_blob).to_vec(),
        FingerprintHash::Sha256 => Sha256::digest(key_blob).to_vec(),
    }
}

/// Rendered fingerprint.
///
/// MD5 and SHA-1 use uppercase colon-separated hex (`9F:1A:...`), SHA-256
/// uses the OpenSSH `SHA256:<base64>` form without padding.
pub fn compute(hash: FingerprintHash, key_blob: &[u8]) -> String {
    let raw = digest(hash, key_blob);
    match hash {
        FingerprintHash::Md5 | FingerprintHash::Sha1 => raw
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"),
        FingerprintHash::Sha256 => {
            format!("SHA256:{}", BASE64.encode(raw).trim_end_matches('='))
        }
    }
}

/// Fingerprint of a key stored as base64 (known_hosts format)
pub fn compute_from_b64(hash: FingerprintHash, stored_b64: &str) -> Option<String> {
    BASE64
        .decode(stored_b64)
        .ok()
        .map(|bytes| compute(hash, &bytes))
}
