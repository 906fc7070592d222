//! PostgreSQL implementation of [`UserDirectory`].

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Result, SocialProfile, User, UserDirectory, UserError};

const USER_COLUMNS: &str = "id, email, password, created_at, verified_at";
const PROFILE_COLUMNS: &str =
    "user_id, provider, client_id, external_id, created_at";

/// PostgreSQL user directory.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    /// Create a new [`PgUserDirectory`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn create_user(
        &self,
        email: &str,
        password_hash: Option<&str>,
        verified: bool,
    ) -> Result<User> {
        let query = format!(
            r#"INSERT INTO users (id, email, password, verified_at)
                VALUES ($1, $2, $3, CASE WHEN $4 THEN NOW() ELSE NULL END)
                RETURNING {USER_COLUMNS}"#
        );

        let user = sqlx::query_as::<_, User>(&query)
            .bind(Uuid::new_v4())
            .bind(email)
            .bind(password_hash)
            .bind(verified)
            .fetch_one(&self.pool)
            .await?;

        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");

        sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<User> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }

    async fn update_email(&self, id: Uuid, email: &str) -> Result<User> {
        let query = format!(
            r#"UPDATE users SET email = $2, verified_at = NULL
                WHERE id = $1
                RETURNING {USER_COLUMNS}"#
        );

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: Option<&str>,
    ) -> Result<User> {
        let query = format!(
            r#"UPDATE users SET password = $2
                WHERE id = $1
                RETURNING {USER_COLUMNS}"#
        );

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(password_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }

    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<User> {
        let query = format!(
            r#"UPDATE users
                SET verified_at = CASE WHEN $2 THEN COALESCE(verified_at, NOW()) ELSE NULL END
                WHERE id = $1
                RETURNING {USER_COLUMNS}"#
        );

        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .bind(verified)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }

    async fn delete_user(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }

        Ok(())
    }

    async fn create_social_profile(
        &self,
        user_id: Uuid,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile> {
        let query = format!(
            r#"INSERT INTO social_profiles (user_id, provider, client_id, external_id)
                VALUES ($1, $2, $3, $4)
                RETURNING {PROFILE_COLUMNS}"#
        );

        let profile = sqlx::query_as::<_, SocialProfile>(&query)
            .bind(user_id)
            .bind(provider)
            .bind(client_id)
            .bind(external_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(profile)
    }

    async fn get_social_profile(
        &self,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile> {
        let query = format!(
            r#"SELECT {PROFILE_COLUMNS} FROM social_profiles
                WHERE provider = $1 AND client_id = $2 AND external_id = $3"#
        );

        sqlx::query_as::<_, SocialProfile>(&query)
            .bind(provider)
            .bind(client_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::{Pool, Postgres};

    #[sqlx::test]
    async fn test_create_and_fetch(pool: Pool<Postgres>) {
        let directory = PgUserDirectory::new(pool);

        let user = directory
            .create_user("john@gmail.com", Some("$argon2id$hash"), false)
            .await
            .unwrap();
        assert!(!user.is_verified());

        let by_email = directory.get_user_by_email("john@gmail.com").await.unwrap();
        let by_id = directory.get_user_by_id(user.id).await.unwrap();
        assert_eq!(by_email, user);
        assert_eq!(by_id, user);
    }

    #[sqlx::test]
    async fn test_duplicate_email_conflicts(pool: Pool<Postgres>) {
        let directory = PgUserDirectory::new(pool);

        directory.create_user("john@gmail.com", None, true).await.unwrap();
        assert!(matches!(
            directory.create_user("john@gmail.com", None, true).await,
            Err(UserError::Conflict)
        ));
    }

    #[sqlx::test]
    async fn test_set_verified_is_idempotent(pool: Pool<Postgres>) {
        let directory = PgUserDirectory::new(pool);
        let user = directory.create_user("john@gmail.com", None, false).await.unwrap();

        let first = directory.set_verified(user.id, true).await.unwrap();
        let second = directory.set_verified(user.id, true).await.unwrap();
        assert!(first.is_verified());
        assert_eq!(first.verified_at, second.verified_at);

        let updated = directory.update_email(user.id, "jane@gmail.com").await.unwrap();
        assert!(!updated.is_verified());
    }

    #[sqlx::test]
    async fn test_password_hash_can_be_cleared(pool: Pool<Postgres>) {
        let directory = PgUserDirectory::new(pool);
        let user = directory
            .create_user("john@gmail.com", Some("$argon2id$old"), false)
            .await
            .unwrap();

        let updated = directory
            .update_password_hash(user.id, Some("$argon2id$new"))
            .await
            .unwrap();
        assert_eq!(updated.password.as_deref(), Some("$argon2id$new"));

        let cleared = directory.update_password_hash(user.id, None).await.unwrap();
        assert!(cleared.password.is_none());
    }

    #[sqlx::test]
    async fn test_social_profile_triple_is_unique(pool: Pool<Postgres>) {
        let directory = PgUserDirectory::new(pool);
        let user = directory.create_user("john@gmail.com", None, true).await.unwrap();

        directory
            .create_social_profile(user.id, "google", "client", "42")
            .await
            .unwrap();
        assert!(matches!(
            directory
                .create_social_profile(user.id, "google", "client", "42")
                .await,
            Err(UserError::Conflict)
        ));

        let profile = directory
            .get_social_profile("google", "client", "42")
            .await
            .unwrap();
        assert_eq!(profile.user_id, user.id);

        directory.delete_user(user.id).await.unwrap();
        assert!(matches!(
            directory.get_social_profile("google", "client", "42").await,
            Err(UserError::NotFound)
        ));
        assert!(matches!(
            directory.delete_user(user.id).await,
            Err(UserError::NotFound)
        ));
    }
}
