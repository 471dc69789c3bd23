use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::sync::OnceLock;

/// Plaintext password as received. `Debug` is redacted.
#[derive(Clone)]
pub struct Password(String);

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

impl Password {
    pub fn new(password: String) -> Self {
        Self(password)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Argon2id with the crate defaults and a fresh salt, as a PHC string.
pub fn hash_password(password: &Password) -> Result<PasswordHashString, anyhow::Error> {
    let argon2 = Argon2::default();
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = argon2
        .hash_password(password.as_str().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();

    Ok(PasswordHashString::new(password_hash))
}

/// Hash used when the account does not exist, so a failed login costs the
/// same Argon2 work either way.
static DUMMY_HASH: OnceLock<Option<PasswordHashString>> = OnceLock::new();

/// Runs a verification against a throwaway hash and discards the outcome.
pub fn dummy_verify(password: &Password) {
    let hash = DUMMY_HASH.get_or_init(|| {
        hash_password(&Password::new("dummy-password-for-timing".to_string())).ok()
    });
    if let Some(hash) = hash {
        let _ = verify_password(password, hash);
    }
}

pub fn verify_password(
    password: &Password,
    password_hash: &PasswordHashString,
) -> Result<(), anyhow::Error> {
    let parsed_hash = PasswordHash::new(password_hash.as_str())
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;

    Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed_hash)
        .map_err(|_| anyhow::anyhow!("Password verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pw(s: &str) -> Password {
        Password::new(s.to_string())
    }

    #[test]
    fn test_hash_is_salted_argon2id() {
        let first = hash_password(&pw("P@ssw0rd")).unwrap();
        let second = hash_password(&pw("P@ssw0rd")).unwrap();

        assert!(first.as_str().starts_with("$argon2id$"));
        assert_ne!(first.as_str(), second.as_str());
        assert!(verify_password(&pw("P@ssw0rd"), &first).is_ok());
        assert!(verify_password(&pw("P@ssw0rd"), &second).is_ok());
    }

    #[test]
    fn test_wrong_password_is_rejected() {
        let hash = hash_password(&pw("P@ssw0rd")).unwrap();
        assert!(verify_password(&pw("p@ssw0rd"), &hash).is_err());
        assert!(verify_password(&pw(""), &hash).is_err());
    }

    #[test]
    fn test_malformed_stored_hash_is_an_error() {
        let hash = PasswordHashString::new("not-a-phc-string".to_string());
        assert!(verify_password(&pw("P@ssw0rd"), &hash).is_err());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        assert_eq!(format!("{:?}", pw("P@ssw0rd")), "Password(***)");
    }

    #[test]
    fn test_dummy_verify_is_repeatable() {
        dummy_verify(&pw("anything"));
        dummy_verify(&pw("anything else"));
    }
}
