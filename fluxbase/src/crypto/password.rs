//! Password hashing using Argon2id
//!
//! Adaptive-cost hashing with explicit parameters. The same hasher also
//! protects service-key secrets at rest. Cost parameters are validated at
//! startup so a bad value fails the boot, not the first sign-up.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::config::PasswordConfig;
use crate::error::{Error, Result};

/// Check hashing parameters without constructing a hasher.
///
/// Called from [`crate::config::Config::validate`]; out-of-range parameters
/// reject the configuration.
pub fn validate_params(config: &PasswordConfig) -> Result<()> {
    Params::new(
        config.memory_cost_kib,
        config.time_cost,
        config.parallelism,
        None,
    )
    .map_err(|e| Error::Config(format!("invalid Argon2 parameters: {}", e)))?;

    if config.min_length < 8 {
        return Err(Error::Config(
            "auth.password.min_length must be at least 8".into(),
        ));
    }

    Ok(())
}

/// Password hasher using Argon2id
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    min_length: usize,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(&PasswordConfig::default()).expect("default Argon2 parameters are valid")
    }
}

impl PasswordHasher {
    /// Create a hasher from validated configuration
    pub fn new(config: &PasswordConfig) -> Result<Self> {
        let params = Params::new(
            config.memory_cost_kib,
            config.time_cost,
            config.parallelism,
            None,
        )
        .map_err(|e| Error::Config(format!("invalid Argon2 parameters: {}", e)))?;

        Ok(Self {
            params,
            min_length: config.min_length,
        })
    }

    /// Hash a password after checking it against the strength policy.
    ///
    /// Returns a PHC string (`$argon2id$v=19$m=...,t=...,p=...$...`).
    pub fn hash(&self, password: &str) -> Result<String> {
        self.check_strength(password)?;
        self.hash_secret(password)
    }

    /// Hash an arbitrary secret (service keys) without the password policy
    pub fn hash_secret(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let hash = argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("failed to hash secret: {}", e)))?;

        Ok(hash.to_string())
    }

    /// Verify a secret against a stored PHC hash.
    ///
    /// Comparison is constant-time with respect to the stored hash; the
    /// parameters are read back from the PHC string.
    pub fn verify(&self, secret: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Internal(format!("invalid stored hash format: {}", e)))?;

        match Argon2::default().verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("verification failed: {}", e))),
        }
    }

    /// Apply the configurable strength policy
    pub fn check_strength(&self, password: &str) -> Result<()> {
        if password.len() < self.min_length {
            return Err(Error::WeakPassword(format!(
                "must be at least {} characters",
                self.min_length
            )));
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(Error::WeakPassword("must contain a digit".into()));
        }
        if !password.chars().any(|c| c.is_alphabetic()) {
            return Err(Error::WeakPassword("must contain a letter".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PasswordHasher::default();
        let hash = hasher.hash("Passw0rd!").unwrap();
        assert!(hash.starts_with("$argon2id$"));

        assert!(hasher.verify("Passw0rd!", &hash).unwrap());
        assert!(!hasher.verify("Passw1rd!", &hash).unwrap());
    }

    #[test]
    fn test_strength_policy() {
        let hasher = PasswordHasher::default();
        assert!(matches!(
            hasher.hash("short1"),
            Err(Error::WeakPassword(_))
        ));
        assert!(matches!(
            hasher.hash("nodigitshere"),
            Err(Error::WeakPassword(_))
        ));
        assert!(matches!(
            hasher.hash("123456789012"),
            Err(Error::WeakPassword(_))
        ));
        assert!(hasher.hash("longenough1").is_ok());
    }

    #[test]
    fn test_same_password_different_salts() {
        let hasher = PasswordHasher::default();
        let h1 = hasher.hash("Passw0rd!").unwrap();
        let h2 = hasher.hash("Passw0rd!").unwrap();
        assert_ne!(h1, h2);
        assert!(hasher.verify("Passw0rd!", &h1).unwrap());
        assert!(hasher.verify("Passw0rd!", &h2).unwrap());
    }

    #[test]
    fn test_service_key_hashing_skips_policy() {
        let hasher = PasswordHasher::default();
        // Raw service keys are random, not policy-checked
        let hash = hasher.hash_secret("fbk_AbCd").unwrap();
        assert!(hasher.verify("fbk_AbCd", &hash).unwrap());
    }

    #[test]
    fn test_out_of_range_params_rejected() {
        let config = PasswordConfig {
            memory_cost_kib: 1, // below Argon2 minimum
            ..Default::default()
        };
        assert!(validate_params(&config).is_err());
    }

    #[test]
    fn test_invalid_stored_hash_errors() {
        let hasher = PasswordHasher::default();
        assert!(hasher.verify("whatever", "not-a-phc-string").is_err());
    }
}
