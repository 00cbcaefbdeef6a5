//! HMAC-SHA256 signing and token hashing
//!
//! Signs CSRF tokens and auth cookies, and computes the SHA-256 digests
//! under which access and refresh tokens are stored. Raw token material is
//! never persisted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Sign a message, returning the URL-safe base64 MAC
pub fn hmac_sign(secret: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Verify a URL-safe base64 MAC in constant time
pub fn hmac_verify(secret: &[u8], message: &[u8], signature: &str) -> bool {
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// SHA-256 of a token, hex-encoded.
///
/// This is the form in which session rows and the blacklist reference
/// tokens. Hashing is deterministic: the same token always yields the same
/// stored value.
pub fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

/// Constant-time byte comparison
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{:02x}", b).expect("writing to String cannot fail");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let sig = hmac_sign(secret, b"message");
        assert!(hmac_verify(secret, b"message", &sig));
        assert!(!hmac_verify(secret, b"tampered", &sig));
        assert!(!hmac_verify(b"another-secret-another-secret-00", b"message", &sig));
    }

    #[test]
    fn test_verify_rejects_garbage_signature() {
        assert!(!hmac_verify(b"secret", b"message", "!!not-base64!!"));
        assert!(!hmac_verify(b"secret", b"message", ""));
    }

    #[test]
    fn test_token_hash_is_deterministic() {
        let h1 = token_hash("refresh-token-value");
        let h2 = token_hash("refresh-token-value");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, token_hash("other-token"));
    }

    #[test]
    fn test_token_hash_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            token_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"same", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
