//! Authentication workflow errors.

use validator::{ValidationError, ValidationErrors};

use crate::email::EmailError;
use crate::password::{POLICY_MESSAGE, WeakPassword};
use crate::token::TokenError;
use crate::user::UserError;

use super::google::OAuthError;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email already exists")]
    DuplicateEmail,
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("token was issued for another purpose")]
    TokenPurposeMismatch,
    #[error("token does not match account state")]
    InvalidToken,
    #[error("email is empty or not verified")]
    UnverifiedOAuthEmail,
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("{stage} failed")]
    Internal {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl AuthError {
    /// Single-field validation failure.
    pub fn field(
        field: &'static str,
        code: &'static str,
        message: &'static str,
    ) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(field, ValidationError::new(code).with_message(message.into()));
        AuthError::Validation(errors)
    }

    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Validation(_) => "validation",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::DuplicateEmail => "duplicate_email",
            AuthError::UserNotFound => "user_not_found",
            AuthError::Token(TokenError::Expired) => "token_expired",
            AuthError::Token(TokenError::InvalidSignature) => {
                "token_invalid_signature"
            },
            AuthError::Token(_) => "token_malformed",
            AuthError::TokenPurposeMismatch => "token_purpose_mismatch",
            AuthError::InvalidToken => "invalid_token",
            AuthError::UnverifiedOAuthEmail => "unverified_oauth_email",
            AuthError::OAuth(_) => "oauth",
            AuthError::Internal { .. } => "internal",
        }
    }
}

impl From<EmailError> for AuthError {
    fn from(err: EmailError) -> Self {
        AuthError::field("email", "email", err.message())
    }
}

impl From<WeakPassword> for AuthError {
    fn from(_: WeakPassword) -> Self {
        AuthError::field("password", "password", POLICY_MESSAGE)
    }
}

/// Map a directory failure, tagging storage errors with `stage`.
///
/// `NotFound` and `Conflict` keep their meaning; callers needing another
/// mapping match on [`UserError`] first.
pub fn storage(stage: &'static str) -> impl FnOnce(UserError) -> AuthError {
    move |err| match err {
        UserError::NotFound => AuthError::UserNotFound,
        UserError::Conflict => AuthError::DuplicateEmail,
        UserError::Storage(source) => AuthError::Internal { stage, source },
    }
}

pub trait ToInternal<T> {
    fn catch(self, stage: &'static str) -> Result<T>;
}

impl<T, E> ToInternal<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn catch(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| AuthError::Internal {
            stage,
            source: Box::new(e),
        })
    }
}
