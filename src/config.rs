//! Configuration manager for hearth.
//!
//! Non-secret settings live in `config.yaml`. Secrets are read from the
//! process environment once, at startup, and never serialized.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroizing;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the token signing secret.
pub const TOKEN_SECRET_ENV: &str = "TOKEN_SECRET";
/// Environment variable holding the Google OAuth client secret.
pub const GOOGLE_SECRET_ENV: &str = "GOOGLE_CLIENT_SECRET";
/// Environment variable overriding the `postgres` section.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
/// Minimum accepted length of the token signing secret, in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing `{0}` environment variable")]
    MissingSecret(&'static str),
    #[error("`{name}` must be at least {min} bytes long, got {len}")]
    WeakSecret {
        name: &'static str,
        len: usize,
        min: usize,
    },
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public base URL of current instance.
    pub url: String,
    /// HTTP listening port.
    pub port: u16,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Expose Prometheus metrics on `/metrics`.
    pub metrics: bool,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Lifetimes of emailed verification tokens.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to "Sign in with Google".
    #[serde(skip_serializing)]
    pub google: Option<Google>,
    /// Cookie session settings.
    #[serde(skip_serializing)]
    pub session: Session,
    /// Per client limits on credential endpoints.
    #[serde(skip_serializing)]
    pub rate_limit: RateLimit,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            url: "http://localhost:8080/".to_owned(),
            port: 8080,
            log_level: "info".to_owned(),
            metrics: true,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            argon2: None,
            token: Token::default(),
            mail: None,
            google: None,
            session: Session::default(),
            rate_limit: RateLimit::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing, in KiB.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 19, // 19 MiB.
            iterations: 2,
            parallelism: 1,
            hash_length: 32,
        }
    }
}

/// Verification token lifetimes, in seconds.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    pub email_verification_ttl: u64,
    pub password_reset_ttl: u64,
    pub delete_confirmation_ttl: u64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            email_verification_ttl: 24 * 60 * 60,
            password_reset_ttl: 15 * 60,
            delete_confirmation_ttl: 60 * 60,
        }
    }
}

/// RabbitMQ mail queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// Google OAuth2 client configuration.
///
/// The client secret is never read from the file, see [`GOOGLE_SECRET_ENV`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Google {
    pub client_id: String,
    /// Defaults to `{url}/login/google/callback`.
    pub redirect_url: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
}

/// Session cookie configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Cookie name.
    pub name: String,
    /// Only send the cookie over HTTPS.
    pub secure: bool,
    /// Session lifetime after last activity.
    pub inactivity_days: i64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            name: "hearth.sid".to_owned(),
            secure: false,
            inactivity_days: 7,
        }
    }
}

/// Request limiting on signup, login and password recovery.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Requests allowed per client and minute. `0` disables limiting.
    pub per_minute: u32,
    /// Read the client address from `X-Forwarded-For` or `X-Real-IP`. Only
    /// enable behind a proxy that overwrites them.
    pub trust_proxy: bool,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_minute: 30,
            trust_proxy: false,
        }
    }
}

/// Process secrets, loaded from environment.
#[derive(Clone)]
pub struct Secrets {
    pub token_secret: Zeroizing<Vec<u8>>,
    pub google_client_secret: Option<Zeroizing<String>>,
    pub database_url: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("token_secret", &"[redacted]")
            .field(
                "google_client_secret",
                &self.google_client_secret.as_ref().map(|_| "[redacted]"),
            )
            .field("database_url", &self.database_url.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl Secrets {
    /// Read secrets from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token_secret = std::env::var(TOKEN_SECRET_ENV)
            .map_err(|_| ConfigError::MissingSecret(TOKEN_SECRET_ENV))?;

        Self::new(
            token_secret.into_bytes(),
            std::env::var(GOOGLE_SECRET_ENV).ok(),
            std::env::var(DATABASE_URL_ENV).ok(),
        )
    }

    /// Build secrets, rejecting a token secret shorter than
    /// [`MIN_SECRET_LENGTH`].
    pub fn new(
        token_secret: Vec<u8>,
        google_client_secret: Option<String>,
        database_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let token_secret = Zeroizing::new(token_secret);
        if token_secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::WeakSecret {
                name: TOKEN_SECRET_ENV,
                len: token_secret.len(),
                min: MIN_SECRET_LENGTH,
            });
        }

        Ok(Self {
            token_secret,
            google_client_secret: google_client_secret.map(Zeroizing::new),
            database_url,
        })
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Absolute URL for a path on this instance.
    pub fn absolute_url(&self, path: &str) -> Result<Url, url::ParseError> {
        Url::parse(&self.url)?.join(path)
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    ///
    /// A missing file falls back to defaults. A file that exists but does
    /// not parse is an error.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let config: Configuration = serde_yaml::from_reader(file)?;
                Ok(Arc::new(self.finalize(config)?))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Parse a configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(Self::default().finalize(config)?)
    }

    fn finalize(&self, mut config: Self) -> Result<Self, url::ParseError> {
        config.version = VERSION.to_owned();
        config.path = self.path.clone();
        config.url = self.normalize_url(&config.url)?;

        if let Some(google) = config.google.as_mut() {
            google.redirect_url = google
                .redirect_url
                .as_deref()
                .map(|u| self.normalize_url(u))
                .transpose()?;
        }

        Ok(config)
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, path = ?self.path, "`config.yaml` file not readable, using defaults");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}
