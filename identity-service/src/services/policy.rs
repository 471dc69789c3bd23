//! Password policy.
//!
//! One policy is chosen at startup and applied to every flow that sets a
//! password: registration, change, reset confirmation and admin creation.

use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Password must be at least {min_length} characters (got {actual_length})")]
    PasswordTooShort {
        min_length: usize,
        actual_length: usize,
    },

    #[error("Password must contain at least one uppercase letter")]
    PasswordMissingUppercase,

    #[error("Password must contain at least one lowercase letter")]
    PasswordMissingLowercase,

    #[error("Password must contain at least one number")]
    PasswordMissingNumber,

    #[error("Password must contain at least one special character")]
    PasswordMissingSpecial,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordPolicy {
    /// Length, upper, lower and digit.
    #[default]
    Standard,
    /// Standard plus one symbol.
    Strict,
}

impl FromStr for PasswordPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(PasswordPolicy::Standard),
            "strict" => Ok(PasswordPolicy::Strict),
            other => Err(format!(
                "Invalid password policy: {} (expected standard or strict)",
                other
            )),
        }
    }
}

fn is_special(c: char) -> bool {
    c.is_ascii_punctuation() || (!c.is_alphanumeric() && !c.is_whitespace())
}

impl PasswordPolicy {
    /// Returns the first violation found.
    pub fn validate(&self, password: &str) -> Result<(), PolicyError> {
        match self.violations(password).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// All violations, for reporting them at once.
    pub fn violations(&self, password: &str) -> Vec<PolicyError> {
        let mut errors = Vec::new();
        let length = password.chars().count();

        if length < MIN_PASSWORD_LENGTH {
            errors.push(PolicyError::PasswordTooShort {
                min_length: MIN_PASSWORD_LENGTH,
                actual_length: length,
            });
        }

        if !password.chars().any(|c| c.is_uppercase()) {
            errors.push(PolicyError::PasswordMissingUppercase);
        }

        if !password.chars().any(|c| c.is_lowercase()) {
            errors.push(PolicyError::PasswordMissingLowercase);
        }

        if !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(PolicyError::PasswordMissingNumber);
        }

        if *self == PasswordPolicy::Strict && !password.chars().any(is_special) {
            errors.push(PolicyError::PasswordMissingSpecial);
        }

        errors
    }
}
