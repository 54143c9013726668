//! Cryptographic logic.
//!
//! Passwords are never stored: only an Argon2id PHC string derived from them
//! with a fresh random salt.

use argon2::password_hash::{
    Error as PasswordHashError, PasswordHash, PasswordHasher,
    PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::rngs::OsRng;

use crate::config::Argon2 as ArgonConfig;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("derivation task aborted: {0}")]
    Aborted(String),
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    ///
    /// Every call draws a new salt, so two hashes of the same password
    /// differ.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    ///
    /// A wrong password yields `Ok(false)`, and so does a stored PHC string
    /// that cannot be decoded into Argon2 inputs (unknown algorithm, bad
    /// params, bad encoding). Any other argon2 failure is an error.
    pub fn verify_password(
        &self,
        phc_hash: &str,
        password: impl AsRef<[u8]>,
    ) -> Result<bool> {
        let parsed = match PasswordHash::new(phc_hash) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(malformed(err)),
        };

        // The stored PHC carries its own params; the configured ones only
        // apply to new hashes.
        match self.argon2().verify_password(password.as_ref(), &parsed) {
            Ok(()) => Ok(true),
            Err(PasswordHashError::Password) => Ok(false),
            Err(err) if is_malformed(&err) => Ok(malformed(err)),
            Err(err) => Err(CryptoError::Argon2(err.to_string())),
        }
    }
}

/// Whether `err` comes from decoding the stored hash rather than hashing.
fn is_malformed(err: &PasswordHashError) -> bool {
    matches!(
        err,
        PasswordHashError::Algorithm
            | PasswordHashError::B64Encoding(_)
            | PasswordHashError::OutputSize { .. }
            | PasswordHashError::ParamNameDuplicated
            | PasswordHashError::ParamNameInvalid
            | PasswordHashError::ParamValueInvalid(_)
            | PasswordHashError::ParamsMaxExceeded
            | PasswordHashError::PhcStringField
            | PasswordHashError::PhcStringTrailingData
            | PasswordHashError::SaltInvalid(_)
            | PasswordHashError::Version
    )
}

fn malformed(err: PasswordHashError) -> bool {
    tracing::warn!(error = %err, "stored password hash is malformed");
    false
}

#[cfg(test)]
pub(crate) fn test_manager() -> PasswordManager {
    PasswordManager::new(Some(ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }))
    .expect("valid argon2 params")
}
