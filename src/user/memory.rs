//! In-memory [`UserDirectory`] for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Result, SocialProfile, User, UserDirectory, UserError};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    profiles: Vec<SocialProfile>,
}

/// Directory backed by vectors behind a lock. Uniqueness checks and inserts
/// happen under the same lock, like a database constraint.
#[derive(Default)]
pub struct MemoryDirectory {
    tables: Mutex<Tables>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.tables.lock().unwrap().users.len()
    }

    pub fn profile_count(&self) -> usize {
        self.tables.lock().unwrap().profiles.len()
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut User)) -> Result<User> {
        let mut tables = self.tables.lock().unwrap();
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(UserError::NotFound)?;
        f(user);
        Ok(user.clone())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn create_user(
        &self,
        email: &str,
        password_hash: Option<&str>,
        verified: bool,
    ) -> Result<User> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.iter().any(|u| u.email == email) {
            return Err(UserError::Conflict);
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_owned(),
            password: password_hash.map(str::to_owned),
            created_at: now,
            verified_at: verified.then_some(now),
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let tables = self.tables.lock().unwrap();
        tables
            .users
            .iter()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(UserError::NotFound)
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<User> {
        let tables = self.tables.lock().unwrap();
        tables
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(UserError::NotFound)
    }

    async fn update_email(&self, id: Uuid, email: &str) -> Result<User> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.iter().any(|u| u.email == email && u.id != id) {
            return Err(UserError::Conflict);
        }

        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(UserError::NotFound)?;
        user.email = email.to_owned();
        user.verified_at = None;
        Ok(user.clone())
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: Option<&str>,
    ) -> Result<User> {
        self.update(id, |user| user.password = password_hash.map(str::to_owned))
    }

    async fn set_verified(&self, id: Uuid, verified: bool) -> Result<User> {
        self.update(id, |user| {
            user.verified_at = if verified {
                user.verified_at.or_else(|| Some(Utc::now()))
            } else {
                None
            };
        })
    }

    async fn delete_user(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let before = tables.users.len();
        tables.users.retain(|u| u.id != id);
        if tables.users.len() == before {
            return Err(UserError::NotFound);
        }
        tables.profiles.retain(|p| p.user_id != id);
        Ok(())
    }

    async fn create_social_profile(
        &self,
        user_id: Uuid,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile> {
        let mut tables = self.tables.lock().unwrap();
        if tables.profiles.iter().any(|p| {
            p.provider == provider
                && p.client_id == client_id
                && p.external_id == external_id
        }) {
            return Err(UserError::Conflict);
        }

        let profile = SocialProfile {
            user_id,
            provider: provider.to_owned(),
            client_id: client_id.to_owned(),
            external_id: external_id.to_owned(),
            created_at: Utc::now(),
        };
        tables.profiles.push(profile.clone());
        Ok(profile)
    }

    async fn get_social_profile(
        &self,
        provider: &str,
        client_id: &str,
        external_id: &str,
    ) -> Result<SocialProfile> {
        let tables = self.tables.lock().unwrap();
        tables
            .profiles
            .iter()
            .find(|p| {
                p.provider == provider
                    && p.client_id == client_id
                    && p.external_id == external_id
            })
            .cloned()
            .ok_or(UserError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_email_changes_keep_uniqueness() {
        const CALLS: usize = 8;

        let directory = Arc::new(MemoryDirectory::new());
        let mut ids = Vec::new();
        for i in 0..CALLS {
            let user = directory
                .create_user(&format!("user{i}@gmail.com"), None, true)
                .await
                .unwrap();
            ids.push(user.id);
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(CALLS));
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let directory = directory.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    directory.update_email(id, "wanted@gmail.com").await
                })
            })
            .collect();

        let mut won = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(user) => {
                    assert_eq!(user.email, "wanted@gmail.com");
                    won += 1;
                },
                Err(err) => assert!(matches!(err, UserError::Conflict)),
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn test_update_email_of_missing_user() {
        let directory = MemoryDirectory::new();

        assert!(matches!(
            directory.update_email(Uuid::new_v4(), "john@gmail.com").await,
            Err(UserError::NotFound)
        ));
    }
}
