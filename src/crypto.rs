//! Password hashing.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use std::sync::Arc;

use argon2::{Argon2, Params, Version};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;

use crate::config::Argon2 as ArgonConfig;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Argon2id password manager.
///
/// Produced hashes are PHC strings: salt and parameters travel with the hash,
/// so verification never needs the configuration that produced it.
#[derive(Debug, Clone)]
pub struct PasswordManager {
    params: Params,
    /// Hash of a random secret, checked when an account has no hash so that
    /// both cases cost one Argon2 run.
    decoy: Arc<str>,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self, CryptoError> {
        let config = config.unwrap_or_default();
        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        let mut manager = Self {
            params,
            decoy: Arc::from(""),
        };
        let secret = Alphanumeric.sample_string(&mut OsRng, 32);
        manager.decoy = manager.hash_password(secret)?.into();

        Ok(manager)
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password with a fresh random salt.
    pub fn hash_password(
        &self,
        password: impl AsRef<[u8]>,
    ) -> Result<String, CryptoError> {
        let salt = SaltString::generate(&mut OsRng);

        self.argon2()
            .hash_password(password.as_ref(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| CryptoError::Argon2(err.to_string()))
    }

    /// Check `password` against a stored PHC hash.
    ///
    /// Fails closed: absent, empty or unparsable hashes and empty passwords
    /// never verify. An absent hash still pays for a full verification.
    pub fn verify_password(
        &self,
        hash: Option<&str>,
        password: impl AsRef<[u8]>,
    ) -> bool {
        let password = password.as_ref();
        let Some(hash) = hash.filter(|h| !h.is_empty()) else {
            self.burn(password);
            return false;
        };
        if password.is_empty() {
            return false;
        }

        match PasswordHash::new(hash) {
            Ok(parsed) => {
                self.argon2().verify_password(password, &parsed).is_ok()
            },
            Err(err) => {
                tracing::warn!(error = %err, "stored password hash is not a PHC string");
                false
            },
        }
    }

    /// Verify against the decoy hash and discard the result.
    fn burn(&self, password: &[u8]) {
        if let Ok(parsed) = PasswordHash::new(&self.decoy) {
            let _ = self.argon2().verify_password(password, &parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PasswordManager {
        // Cheap parameters keep tests fast.
        PasswordManager::new(Some(ArgonConfig {
            memory_cost: 1024,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap()
    }

    #[test]
    fn test_hash_then_verify() {
        let pwd = manager();
        let hash = pwd.hash_password("Abcdef12").unwrap();

        assert!(hash.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
        assert!(pwd.verify_password(Some(&hash), "Abcdef12"));
        assert!(!pwd.verify_password(Some(&hash), "abcdef12"));
    }

    #[test]
    fn test_salt_is_random() {
        let pwd = manager();
        assert_ne!(
            pwd.hash_password("Abcdef12").unwrap(),
            pwd.hash_password("Abcdef12").unwrap()
        );
    }

    #[test]
    fn test_verify_fails_closed() {
        let pwd = manager();
        let hash = pwd.hash_password("Abcdef12").unwrap();

        assert!(!pwd.verify_password(None, "Abcdef12"));
        assert!(!pwd.verify_password(Some(""), "Abcdef12"));
        assert!(!pwd.verify_password(Some(""), ""));
        assert!(!pwd.verify_password(Some("not-a-phc-string"), "Abcdef12"));
        assert!(!pwd.verify_password(Some(&hash), ""));
    }

    #[test]
    fn test_hash_embeds_parameters() {
        let hash = manager().hash_password("Abcdef12").unwrap();
        let stronger = PasswordManager::new(None).unwrap();

        // Verification reads parameters from the hash itself.
        assert!(stronger.verify_password(Some(&hash), "Abcdef12"));
    }

    #[test]
    fn test_decoy_uses_configured_parameters() {
        let pwd = manager();

        assert!(pwd.decoy.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
        assert!(PasswordHash::new(&pwd.decoy).is_ok());
        assert_ne!(pwd.decoy, manager().decoy);
    }

    #[test]
    fn test_invalid_parameters() {
        let result = PasswordManager::new(Some(ArgonConfig {
            memory_cost: 1,
            iterations: 0,
            parallelism: 1,
            hash_length: 32,
        }));
        assert!(matches!(result, Err(CryptoError::Argon2(_))));
    }
}
