//! Cryptographic primitives
//!
//! Pure utilities with no I/O: password hashing, HMAC signing for cookies
//! and CSRF tokens, AEAD field encryption and per-user key derivation.

pub mod aead;
pub mod hmac;
pub mod keys;
pub mod password;

pub use aead::FieldCipher;
pub use hmac::{constant_time_eq, hmac_sign, hmac_verify, token_hash};
pub use keys::derive_user_key;
pub use password::PasswordHasher;
