use std::fmt;

/// What a single-use cache token is good for. The purpose prefixes the
/// cache key so a reset token can never verify an email and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    PasswordReset,
    EmailVerification,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::PasswordReset => "password_reset",
            TokenPurpose::EmailVerification => "email_verification",
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        match self {
            TokenPurpose::PasswordReset => 60 * 60,
            TokenPurpose::EmailVerification => 24 * 60 * 60,
        }
    }

    pub fn cache_key(&self, token: &str) -> String {
        format!("{}:{}", self.as_str(), token)
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_and_ttls() {
        assert_eq!(
            TokenPurpose::PasswordReset.cache_key("abc"),
            "password_reset:abc"
        );
        assert_eq!(
            TokenPurpose::EmailVerification.cache_key("abc"),
            "email_verification:abc"
        );
        assert_eq!(TokenPurpose::PasswordReset.ttl_seconds(), 3600);
        assert_eq!(TokenPurpose::EmailVerification.ttl_seconds(), 86400);
    }
}
