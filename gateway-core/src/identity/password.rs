//! Argon2id password hashing, adapted from `acton-service::auth::password`.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::config::PasswordConfig;
use crate::error::Error;

/// Password hasher using Argon2id with OWASP-recommended parameters by
/// default; parameters are configurable via [`PasswordConfig`].
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    min_password_length: usize,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(&PasswordConfig::default())
    }
}

impl PasswordHasher {
    #[must_use]
    pub fn new(config: &PasswordConfig) -> Self {
        let params = Params::new(config.memory_cost_kib, config.time_cost, config.parallelism, None)
            .expect("invalid Argon2 parameters");
        Self { params, min_password_length: config.min_password_length }
    }

    /// Hash a password, returning a self-describing PHC string.
    pub fn hash(&self, password: &str) -> Result<String, Error> {
        if password.len() < self.min_password_length {
            return Err(Error::Validation(format!(
                "password must be at least {} characters",
                self.min_password_length
            )));
        }
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("failed to hash password: {e}")))?;
        Ok(hash.to_string())
    }

    /// Constant-time verification against a PHC string hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, Error> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| Error::Internal(format!("invalid password hash format: {e}")))?;
        let argon2 = Argon2::default();
        match argon2.verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {e}"))),
        }
    }

    /// Whether `hash` was produced with different parameters than this
    /// hasher's current configuration.
    #[must_use]
    pub fn needs_rehash(&self, hash: &str) -> bool {
        let Ok(parsed_hash) = PasswordHash::new(hash) else {
            return true;
        };
        if parsed_hash.algorithm != argon2::Algorithm::Argon2id.ident() {
            return true;
        }
        let Some(version) = parsed_hash.version else {
            return true;
        };
        if version != 19 {
            return true;
        }
        let params = &parsed_hash.params;
        let m = params.iter().find(|(k, _)| k.as_str() == "m").and_then(|(_, v)| v.decimal().ok());
        let t = params.iter().find(|(k, _)| k.as_str() == "t").and_then(|(_, v)| v.decimal().ok());
        let p = params.iter().find(|(k, _)| k.as_str() == "p").and_then(|(_, v)| v.decimal().ok());
        m != Some(self.params.m_cost()) || t != Some(self.params.t_cost()) || p != Some(self.params.p_cost())
    }

    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hasher = PasswordHasher::default();
        let hash = hasher.hash("test_password_123").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("test_password_123", &hash).unwrap());
        assert!(!hasher.verify("wrong_password", &hash).unwrap());
    }

    #[test]
    fn password_too_short_is_rejected() {
        let hasher = PasswordHasher::default();
        let err = hasher.hash("short").unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }

    #[test]
    fn needs_rehash_detects_parameter_drift() {
        let weak = PasswordHasher::new(&PasswordConfig { memory_cost_kib: 8192, ..PasswordConfig::default() });
        let hash = weak.hash("test_password_123").unwrap();
        let strong = PasswordHasher::default();
        assert!(strong.needs_rehash(&hash));
    }

    #[test]
    fn same_password_hashes_differently_each_time() {
        let hasher = PasswordHasher::default();
        let a = hasher.hash("test_password_123").unwrap();
        let b = hasher.hash("test_password_123").unwrap();
        assert_ne!(a, b);
    }
}
