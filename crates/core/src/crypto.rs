//! Content hashing and at-rest sealing of sensitive payloads.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

use crate::errors::{CoreError, Result};

/// Length of the XChaCha20-Poly1305 nonce prepended to sealed payloads.
const NONCE_LEN: usize = 24;

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Seals sensitive payload fields before they leave the local process.
///
/// The key comes from the deployment environment (`DATA_ENCRYPTION_KEY`,
/// 64 hex chars) and is never logged or persisted.
pub struct PayloadCipher {
    cipher: XChaCha20Poly1305,
}

impl PayloadCipher {
    /// Build a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Read the key from the environment; `None` when unset.
    pub fn from_env() -> Option<Self> {
        let hex = std::env::var("DATA_ENCRYPTION_KEY").ok()?;
        Self::from_hex_key(hex.trim())
    }

    /// Parse a 64-hex-char key. `None` on malformed input.
    pub fn from_hex_key(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut key = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            key[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Self::new(&key))
    }

    /// Encrypt; output is `nonce || ciphertext`.
    ///
    /// The nonce is synthesized from the plaintext, so sealing is
    /// deterministic: the same payload always seals to the same bytes.
    /// Sync relies on this for idempotent re-application; the tradeoff is
    /// that equal payloads are recognizable as equal in the peer store.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(plaintext);
        let nonce = XNonce::from_slice(&digest[..NONCE_LEN]);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CoreError::internal("payload encryption failed"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a `nonce || ciphertext` blob produced by [`seal`].
    ///
    /// [`seal`]: PayloadCipher::seal
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(CoreError::internal("sealed payload too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CoreError::internal("payload decryption failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_hex_encoded() {
        let hash = sha256_hex(b"hello");
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn seal_open_round_trip() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let sealed = cipher.seal(b"api-key-123").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"api-key-123");
        assert_eq!(cipher.open(&sealed).unwrap(), b"api-key-123");
    }

    #[test]
    fn sealing_is_deterministic_per_payload() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        assert_eq!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
        assert_ne!(cipher.seal(b"one").unwrap(), cipher.seal(b"two").unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = PayloadCipher::new(&[7u8; 32]);
        let mut sealed = cipher.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn hex_key_parsing() {
        assert!(PayloadCipher::from_hex_key(&"ab".repeat(32)).is_some());
        assert!(PayloadCipher::from_hex_key("short").is_none());
        assert!(PayloadCipher::from_hex_key(&"zz".repeat(32)).is_none());
    }
}
