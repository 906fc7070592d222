//! Authentication workflows.
//!
//! Every operation is short and stateless. Races between concurrent
//! requests (same email at signup, same remote account at first social
//! login) are settled by directory uniqueness constraints, and a
//! [`UserError::Conflict`] is handled as an expected outcome.

mod error;
pub mod google;

pub use error::*;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config;
use crate::crypto::PasswordManager;
use crate::email::EmailValidator;
use crate::mail::{Mailer, Template};
use crate::password;
use crate::telemetry;
use crate::token::{Purpose, VerificationToken, VerificationTokens, password_stamp};
use crate::user::{User, UserDirectory, UserError};
use google::{OAuthProvider, RemoteProfile};

/// Lifetimes of issued verification tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTtl {
    pub email_verification: Duration,
    pub password_reset: Duration,
    pub delete_confirmation: Duration,
}

impl From<&config::Token> for TokenTtl {
    fn from(config: &config::Token) -> Self {
        Self {
            email_verification: Duration::from_secs(config.email_verification_ttl),
            password_reset: Duration::from_secs(config.password_reset_ttl),
            delete_confirmation: Duration::from_secs(
                config.delete_confirmation_ttl,
            ),
        }
    }
}

fn observe<T>(event: &'static str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => telemetry::record_auth_event(event, "success"),
        Err(AuthError::Internal { stage, source }) => {
            tracing::error!(event, stage, error = %source, "auth operation failed");
            telemetry::record_auth_event(event, "internal");
        },
        Err(err) => {
            tracing::info!(event, reason = err.kind(), error = %err, "auth operation rejected");
            telemetry::record_auth_event(event, err.kind());
        },
    }
    result
}

fn expect_purpose(payload: &VerificationToken, purpose: Purpose) -> Result<()> {
    if payload.purpose == purpose {
        Ok(())
    } else {
        Err(AuthError::TokenPurposeMismatch)
    }
}

fn token_user_id(payload: &VerificationToken) -> Result<Uuid> {
    Uuid::parse_str(&payload.user_id).map_err(|_| AuthError::InvalidToken)
}

/// Run CPU-bound work off the async runtime. A panicked or cancelled task is
/// an internal failure of `stage`.
async fn blocking<T, F>(stage: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.catch(stage)
}

/// Signup, login, recovery, verification and federation workflows.
#[derive(Clone)]
pub struct AuthService {
    directory: Arc<dyn UserDirectory>,
    mailer: Arc<dyn Mailer>,
    emails: EmailValidator,
    passwords: PasswordManager,
    tokens: VerificationTokens,
    ttl: TokenTtl,
}

impl AuthService {
    /// Create a new [`AuthService`].
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        mailer: Arc<dyn Mailer>,
        emails: EmailValidator,
        passwords: PasswordManager,
        tokens: VerificationTokens,
        ttl: TokenTtl,
    ) -> Self {
        Self {
            directory,
            mailer,
            emails,
            passwords,
            tokens,
            ttl,
        }
    }

    async fn hash(&self, password: &str) -> Result<String> {
        let passwords = self.passwords.clone();
        let password = Zeroizing::new(password.to_owned());

        blocking("password hashing", move || {
            passwords.hash_password(password.as_bytes())
        })
        .await?
        .catch("password hashing")
    }

    /// `hash` is `None` for unknown or password-less accounts, which still
    /// cost one verification.
    async fn verify(&self, hash: Option<String>, password: &str) -> Result<bool> {
        let passwords = self.passwords.clone();
        let password = Zeroizing::new(password.to_owned());

        blocking("password verification", move || {
            passwords.verify_password(hash.as_deref(), password.as_bytes())
        })
        .await
    }

    /// Issue a token and mail it with `template`. Delivery failures are
    /// logged and swallowed.
    async fn issue_and_send(
        &self,
        user: &User,
        template: Template,
        payload: VerificationToken,
        ttl: Duration,
    ) -> Result<()> {
        let token = self
            .tokens
            .generate(&payload, ttl)
            .catch("token generation")?;

        let (id, email) = (user.id, user.email.as_str());
        let sent = match template {
            Template::Welcome => {
                self.mailer.send_welcome_email(id, email, &token).await
            },
            Template::Verification => {
                self.mailer.send_verification_email(id, email, &token).await
            },
            Template::PasswordReset => {
                self.mailer.send_password_reset_email(id, email, &token).await
            },
            Template::AccountDeletion => {
                self.mailer.send_account_deletion_email(id, email, &token).await
            },
        };

        if let Err(err) = sent {
            tracing::error!(user_id = %id, ?template, error = %err, "failed to dispatch email");
        }

        Ok(())
    }

    /// Current state of an account.
    pub async fn user(&self, id: Uuid) -> Result<User> {
        self.directory
            .get_user_by_id(id)
            .await
            .map_err(storage("user lookup"))
    }

    /// Register a password account and send the welcome email.
    #[tracing::instrument(skip_all)]
    pub async fn signup(&self, email: &str, password: &str) -> Result<User> {
        let result = async {
            let email = self.emails.sanitize(email, true).await?.to_string();

            match self.directory.get_user_by_email(&email).await {
                Ok(_) => return Err(AuthError::DuplicateEmail),
                Err(UserError::NotFound) => {},
                Err(err) => return Err(storage("user lookup")(err)),
            }

            password::validate(password)?;
            let hash = self.hash(password).await?;

            let user = self
                .directory
                .create_user(&email, Some(&hash), false)
                .await
                .map_err(storage("user creation"))?;

            self.issue_and_send(
                &user,
                Template::Welcome,
                VerificationToken::email_verification(user.id, &user.email),
                self.ttl.email_verification,
            )
            .await?;

            tracing::info!(user_id = %user.id, "account created");
            Ok(user)
        }
        .await;

        observe("signup", result)
    }

    /// Check a password login. Every failure is [`AuthError::InvalidCredentials`].
    #[tracing::instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> Result<User> {
        let result = async {
            let email = self
                .emails
                .sanitize(email, false)
                .await
                .map_err(|_| AuthError::InvalidCredentials)?
                .to_string();

            let user = match self.directory.get_user_by_email(&email).await {
                Ok(user) => user,
                Err(UserError::NotFound) => {
                    self.verify(None, password).await?;
                    return Err(AuthError::InvalidCredentials);
                },
                Err(err) => return Err(storage("user lookup")(err)),
            };

            if !self.verify(user.password.clone(), password).await? {
                return Err(AuthError::InvalidCredentials);
            }

            Ok(user)
        }
        .await;

        observe("login", result)
    }

    /// Email a password reset link. Succeeds whether or not the account
    /// exists.
    #[tracing::instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let result = async {
            let email = self.emails.sanitize(email, true).await?.to_string();

            let user = match self.directory.get_user_by_email(&email).await {
                Ok(user) => user,
                Err(UserError::NotFound) => {
                    tracing::info!("password reset requested for unknown account");
                    return Ok(());
                },
                Err(err) => return Err(storage("user lookup")(err)),
            };

            self.issue_and_send(
                &user,
                Template::PasswordReset,
                VerificationToken::password_reset(
                    user.id,
                    &user.email,
                    user.password.as_deref(),
                ),
                self.ttl.password_reset,
            )
            .await
        }
        .await;

        observe("forgot_password", result)
    }

    /// Replace the password of the account named by a reset token.
    ///
    /// A token is void once any password change happened after it was
    /// issued.
    #[tracing::instrument(skip_all)]
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<User> {
        let result = async {
            let payload = self.tokens.verify(token)?;
            expect_purpose(&payload, Purpose::PasswordReset)?;
            password::validate(new_password)?;

            let user = match self.directory.get_user_by_id(token_user_id(&payload)?).await {
                Ok(user) => user,
                Err(UserError::NotFound) => return Err(AuthError::InvalidToken),
                Err(err) => return Err(storage("user lookup")(err)),
            };

            let stamp = password_stamp(user.password.as_deref());
            if user.email != payload.email || payload.stamp.as_deref() != Some(stamp.as_str()) {
                return Err(AuthError::InvalidToken);
            }

            let hash = self.hash(new_password).await?;
            self.directory
                .update_password_hash(user.id, Some(&hash))
                .await
                .map_err(storage("password update"))
        }
        .await;

        observe("reset_password", result)
    }

    /// Mark the account named by an email verification token as verified.
    /// Verifying twice is harmless.
    #[tracing::instrument(skip_all)]
    pub async fn verify_email(&self, token: &str) -> Result<User> {
        let result = async {
            let payload = self.tokens.verify(token)?;
            expect_purpose(&payload, Purpose::EmailVerification)?;

            let user = match self.directory.get_user_by_email(&payload.email).await {
                Ok(user) => user,
                Err(UserError::NotFound) => return Err(AuthError::InvalidToken),
                Err(err) => return Err(storage("user lookup")(err)),
            };

            // The address may have moved to another account since issue.
            if user.id != token_user_id(&payload)? {
                return Err(AuthError::InvalidToken);
            }

            self.directory
                .set_verified(user.id, true)
                .await
                .map_err(storage("verification update"))
        }
        .await;

        observe("verify_email", result)
    }

    /// Send a fresh verification email. No-op for verified accounts.
    pub async fn resend_verification(&self, user_id: Uuid) -> Result<()> {
        let result = async {
            let user = self.user(user_id).await?;
            if user.is_verified() {
                return Ok(());
            }

            self.issue_and_send(
                &user,
                Template::Verification,
                VerificationToken::email_verification(user.id, &user.email),
                self.ttl.email_verification,
            )
            .await
        }
        .await;

        observe("resend_verification", result)
    }

    /// Change password after checking the current one.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current: &str,
        new_password: &str,
    ) -> Result<User> {
        let result = async {
            let user = self.user(user_id).await?;
            if !self.verify(user.password.clone(), current).await? {
                return Err(AuthError::InvalidCredentials);
            }

            password::validate(new_password)?;
            let hash = self.hash(new_password).await?;

            self.directory
                .update_password_hash(user.id, Some(&hash))
                .await
                .map_err(storage("password update"))
        }
        .await;

        observe("change_password", result)
    }

    /// Move an account to a new address, which must be verified again.
    pub async fn change_email(&self, user_id: Uuid, email: &str) -> Result<User> {
        let result = async {
            let email = self.emails.sanitize(email, true).await?.to_string();
            let user = self.user(user_id).await?;
            if user.email == email {
                return Ok(user);
            }

            let user = self
                .directory
                .update_email(user.id, &email)
                .await
                .map_err(storage("email update"))?;

            self.issue_and_send(
                &user,
                Template::Verification,
                VerificationToken::email_verification(user.id, &user.email),
                self.ttl.email_verification,
            )
            .await?;

            Ok(user)
        }
        .await;

        observe("change_email", result)
    }

    /// Email a link confirming account destruction.
    pub async fn request_account_deletion(&self, user_id: Uuid) -> Result<()> {
        let result = async {
            let user = self.user(user_id).await?;

            self.issue_and_send(
                &user,
                Template::AccountDeletion,
                VerificationToken::delete_confirmation(user.id, &user.email),
                self.ttl.delete_confirmation,
            )
            .await
        }
        .await;

        observe("request_account_deletion", result)
    }

    /// Delete the account named by a deletion token, returning its id.
    pub async fn confirm_account_deletion(&self, token: &str) -> Result<Uuid> {
        let result = async {
            let payload = self.tokens.verify(token)?;
            expect_purpose(&payload, Purpose::DeleteUserConfirmation)?;

            let user = match self.directory.get_user_by_id(token_user_id(&payload)?).await {
                Ok(user) => user,
                Err(UserError::NotFound) => return Err(AuthError::InvalidToken),
                Err(err) => return Err(storage("user lookup")(err)),
            };
            if user.email != payload.email {
                return Err(AuthError::InvalidToken);
            }

            self.directory
                .delete_user(user.id)
                .await
                .map_err(storage("user deletion"))?;

            tracing::info!(user_id = %user.id, "account deleted");
            Ok(user.id)
        }
        .await;

        observe("confirm_account_deletion", result)
    }

    /// Exchange an authorization code and resolve the local account.
    #[tracing::instrument(skip_all, fields(provider = provider.provider()))]
    pub async fn oauth_authenticate(
        &self,
        provider: &dyn OAuthProvider,
        code: &str,
    ) -> Result<User> {
        let result = async {
            let profile = provider.exchange(code).await?;
            self.federate(provider.provider(), provider.client_id(), &profile)
                .await
        }
        .await;

        observe("oauth", result)
    }

    /// Resolve a remote profile to a local user, linking it on first use.
    ///
    /// Accounts created here have no password and a verified email. An
    /// existing unverified account with the same address is claimed: it
    /// becomes verified and loses its password, which whoever registered it
    /// never proved to own.
    pub async fn federate(
        &self,
        provider: &str,
        client_id: &str,
        profile: &RemoteProfile,
    ) -> Result<User> {
        match self
            .directory
            .get_social_profile(provider, client_id, &profile.id)
            .await
        {
            Ok(link) => return self.user(link.user_id).await,
            Err(UserError::NotFound) => {},
            Err(err) => return Err(storage("social profile lookup")(err)),
        }

        if profile.email.is_empty() || !profile.verified_email {
            return Err(AuthError::UnverifiedOAuthEmail);
        }
        let email = self.emails.sanitize(&profile.email, false).await?.to_string();

        let user = match self.directory.get_user_by_email(&email).await {
            Ok(user) if user.is_verified() => user,
            Ok(user) => self.claim(user).await?,
            Err(UserError::NotFound) => {
                match self.directory.create_user(&email, None, true).await {
                    Ok(user) => user,
                    Err(UserError::Conflict) => self
                        .directory
                        .get_user_by_email(&email)
                        .await
                        .map_err(storage("user lookup"))?,
                    Err(err) => return Err(storage("user creation")(err)),
                }
            },
            Err(err) => return Err(storage("user lookup")(err)),
        };

        match self
            .directory
            .create_social_profile(user.id, provider, client_id, &profile.id)
            .await
        {
            Ok(_) => {
                tracing::info!(user_id = %user.id, provider, "social profile linked");
                Ok(user)
            },
            Err(UserError::Conflict) => {
                let link = self
                    .directory
                    .get_social_profile(provider, client_id, &profile.id)
                    .await
                    .map_err(storage("social profile lookup"))?;
                self.user(link.user_id).await
            },
            Err(err) => Err(storage("social profile creation")(err)),
        }
    }

    async fn claim(&self, user: User) -> Result<User> {
        self.directory
            .update_password_hash(user.id, None)
            .await
            .map_err(storage("password removal"))?;
        let user = self
            .directory
            .set_verified(user.id, true)
            .await
            .map_err(storage("verification update"))?;

        tracing::warn!(user_id = %user.id, "unverified account claimed by identity provider");
        Ok(user)
    }
}

/// In-memory collaborators wired into an [`AuthService`].
#[cfg(test)]
pub(crate) struct Harness {
    pub service: AuthService,
    pub directory: Arc<crate::user::MemoryDirectory>,
    pub mailer: Arc<crate::mail::RecordingMailer>,
    pub clock: Arc<crate::clock::FixedClock>,
    pub tokens: VerificationTokens,
}

#[cfg(test)]
impl Harness {
    pub const NOW: u64 = 1_750_000_000;

    pub fn new() -> Self {
        let directory = Arc::new(crate::user::MemoryDirectory::new());
        Self::with_directory(directory.clone(), directory)
    }

    /// Build with `port` in front of the in-memory `directory`.
    pub fn with_directory(
        directory: Arc<crate::user::MemoryDirectory>,
        port: Arc<dyn UserDirectory>,
    ) -> Self {
        let mailer = Arc::new(crate::mail::RecordingMailer::default());
        let clock = Arc::new(crate::clock::FixedClock::new(Self::NOW));
        let tokens = VerificationTokens::new(
            Zeroizing::new(b"0123456789abcdef0123456789abcdef".to_vec()),
            clock.clone(),
        );
        let passwords = PasswordManager::new(Some(config::Argon2 {
            memory_cost: 1024,
            iterations: 1,
            parallelism: 1,
            hash_length: 32,
        }))
        .unwrap();
        let emails = EmailValidator::new(Arc::new(
            crate::email::StaticResolver::new(&["gmail.com", "mail.dev"]),
        ));

        let service = AuthService::new(
            port,
            mailer.clone(),
            emails,
            passwords,
            tokens.clone(),
            TokenTtl::from(&config::Token::default()),
        );

        Self {
            service,
            directory,
            mailer,
            clock,
            tokens,
        }
    }

    /// Token carried by the last sent mail.
    pub fn last_token(&self) -> String {
        self.mailer.last().unwrap().token
    }
}
