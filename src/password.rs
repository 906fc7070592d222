//! Password strength policy.
//!
//! Length bounds (8 to 64 characters) are enforced by form schemas before
//! this policy runs.

use validator::ValidationError;

pub const POLICY_MESSAGE: &str =
    "Password must contain at least one digit, uppercase, and lowercase letters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("password must contain at least one digit, uppercase, and lowercase letters")]
pub struct WeakPassword;

/// Require at least one ASCII digit, one uppercase and one lowercase letter.
pub fn validate(password: &str) -> Result<(), WeakPassword> {
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());

    if has_digit && has_upper && has_lower {
        Ok(())
    } else {
        Err(WeakPassword)
    }
}

/// [`validate`] as a `validator` custom rule.
pub fn validate_strength(password: &str) -> Result<(), ValidationError> {
    validate(password).map_err(|_| {
        ValidationError::new("password").with_message(POLICY_MESSAGE.into())
    })
}
