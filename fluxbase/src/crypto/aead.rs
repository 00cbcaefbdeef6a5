//! AEAD field encryption (AES-256-GCM)
//!
//! Encrypts individual sensitive fields with a single process-wide master
//! key. The 12-byte nonce is random per message and prepended to the
//! ciphertext; the whole blob is base64-encoded for storage in text columns.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Process-wide field cipher
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    /// Create a cipher from a 32-byte master key
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt a plaintext, returning base64(nonce || ciphertext)
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Internal("AEAD encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    /// Decrypt base64(nonce || ciphertext); any mutation fails the open
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>> {
        let blob = STANDARD.decode(encoded).map_err(|_| Error::CryptoInvalid)?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::CryptoInvalid);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::CryptoInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> FieldCipher {
        FieldCipher::new(&[7u8; 32])
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher();
        let sealed = c.seal(b"top secret value").unwrap();
        assert_eq!(c.open(&sealed).unwrap(), b"top secret value");
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let c = cipher();
        let a = c.seal(b"same plaintext").unwrap();
        let b = c.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_any_mutated_byte_fails_open() {
        let c = cipher();
        let sealed = c.seal(b"payload").unwrap();
        let mut blob = STANDARD.decode(&sealed).unwrap();
        for i in 0..blob.len() {
            blob[i] ^= 0x01;
            let tampered = STANDARD.encode(&blob);
            assert!(matches!(c.open(&tampered), Err(Error::CryptoInvalid)));
            blob[i] ^= 0x01;
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().seal(b"payload").unwrap();
        let other = FieldCipher::new(&[8u8; 32]);
        assert!(matches!(other.open(&sealed), Err(Error::CryptoInvalid)));
    }

    #[test]
    fn test_garbage_input_fails() {
        let c = cipher();
        assert!(matches!(c.open("not base64 !!"), Err(Error::CryptoInvalid)));
        assert!(matches!(c.open("AAAA"), Err(Error::CryptoInvalid)));
    }
}
