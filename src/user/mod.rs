//! User directory: accounts and their linked social profiles.

#[cfg(test)]
mod memory;
mod repository;

#[cfg(test)]
pub use memory::*;
pub use repository::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, UserError>;

#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("record violates a uniqueness constraint")]
    Conflict,
    #[error("storage failure")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<sqlx::Error> for UserError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => UserError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                UserError::Conflict
            },
            _ => UserError::Storage(Box::new(err)),
        }
    }
}

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// Canonical address, see [`crate::email::sanitize`].
    pub email: String,
    /// PHC hash. `None` for accounts created through a social provider.
    #[serde(skip)]
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_verified(&self) -> bool {
        self.verified_at.is_some()
    }
}

/// Link between a [`User`] and an account on an external identity
/// provider.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct SocialProfile {
    pub user_id: Uuid,
    pub provider: String,
    pub client_id: String,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// Port for user persistence.
///
/// Uniqueness (email, social profile triple) is enforced here and reported
/// as [`UserError::Conflict`].
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Create a user. `verified` stamps `verified_at` on creation.
    async fn create_user(
        &self,
        email: &str,
        password_hash: Option<&str>,
        verified: bool,
    ) -> Result<User>;

    async fn get_user_by_email(&self, email: &str) -> Result<User>;

    async fn get_user_by_id(&self, id: Uuid) -> Result<User>;

    /// Replace the email and clear `verified_at`.
    async fn update_email(&self, id: Uuid, email: &str) -> Result<User>;

    /// Replace the password hash. `None` leaves the account without a
    /// password.
    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: Option<&str>,
    ) -> Result<User>;

    /// Keeps the first verification timestamp when already verified.
    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<User>;

    /// Delete a user and its social profiles.
    async fn delete_user(&self, id: Uuid) -> Result<()>;

    async fn create_social_profile(
        &self,
        user_id: Uuid,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile>;

    async fn get_social_profile(
        &self,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile>;
}
