//! One-way credential hashing and verification (Argon2id).

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid hashing parameters: {0}")]
    InvalidParams(String),

    #[error("stored credential hash is malformed: {0}")]
    MalformedHash(String),

    #[error("credential hashing failed: {0}")]
    Hashing(String),
}

/// Argon2 cost parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingCost {
    /// OWASP minimum for Argon2id.
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Stateless secret verification. The hash format is opaque to callers.
pub trait CredentialVerifier: Send + Sync + 'static {
    /// `Ok(false)` for a wrong secret; `Err` only when the stored hash itself
    /// cannot be interpreted.
    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, CredentialError>;

    fn hash(&self, plaintext: &str) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone)]
pub struct Argon2Verifier {
    params: Params,
}

impl Argon2Verifier {
    pub fn new(cost: HashingCost) -> Result<Self, CredentialError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| CredentialError::InvalidParams(e.to_string()))?;
        Ok(Self { params })
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, CredentialError> {
        let parsed =
            PasswordHash::new(hash).map_err(|e| CredentialError::MalformedHash(e.to_string()))?;
        // Cost is read back from the hash itself, so older hashes keep verifying
        // after the configured cost changes.
        Ok(self
            .hasher()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok())
    }

    fn hash(&self, plaintext: &str) -> Result<String, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| CredentialError::Hashing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Argon2Verifier {
        Argon2Verifier::new(HashingCost {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn hash_then_verify() {
        let verifier = cheap();
        let hash = verifier.hash("correct horse").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verifier.verify("correct horse", &hash).unwrap());
        assert!(!verifier.verify("battery staple", &hash).unwrap());
    }

    #[test]
    fn salts_differ_between_hashes() {
        let verifier = cheap();
        assert_ne!(verifier.hash("pw").unwrap(), verifier.hash("pw").unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error_not_a_mismatch() {
        let verifier = cheap();
        assert!(matches!(
            verifier.verify("pw", "not-a-phc-string"),
            Err(CredentialError::MalformedHash(_))
        ));
    }

    #[test]
    fn zero_memory_is_rejected() {
        let err = Argon2Verifier::new(HashingCost {
            memory_kib: 0,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap_err();
        assert!(matches!(err, CredentialError::InvalidParams(_)));
    }
}
