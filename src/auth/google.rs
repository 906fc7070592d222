//! "Sign in with Google".
//!
//! The consent URL and the code exchange follow the authorization code
//! flow. The userinfo endpoint gives the remote profile used to find or
//! create the local account.

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use url::Url;

use crate::config::Google;

pub const PROVIDER: &str = "google";
const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
    #[error("userinfo request failed")]
    Userinfo(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Profile returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteProfile {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
    pub picture: Option<String>,
}

/// Port for an OAuth2 identity provider.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider type stored on social profiles.
    fn provider(&self) -> &str;

    /// OAuth client identifier stored on social profiles.
    fn client_id(&self) -> &str;

    /// Consent page URL carrying `state`.
    fn authorize_url(&self, state: &str) -> Url;

    /// Exchange an authorization code for the remote profile.
    async fn exchange(&self, code: &str) -> Result<RemoteProfile, OAuthError>;
}

/// OAuth client type with auth URL and token URL set.
type ConfiguredClient = oauth2::Client<
    oauth2::basic::BasicErrorResponse,
    oauth2::basic::BasicTokenResponse,
    oauth2::basic::BasicTokenIntrospectionResponse,
    oauth2::StandardRevocableToken,
    oauth2::basic::BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// Google identity provider.
pub struct GoogleOAuth {
    client: ConfiguredClient,
    client_id: String,
    userinfo_url: Url,
    http: reqwest::Client,
}

impl GoogleOAuth {
    /// Create a new [`GoogleOAuth`]. `default_redirect` is used when the
    /// configuration does not name a callback URL.
    pub fn new(
        config: &Google,
        client_secret: &str,
        default_redirect: Url,
    ) -> Result<Self, OAuthError> {
        let redirect = config
            .redirect_url
            .clone()
            .unwrap_or_else(|| default_redirect.to_string());

        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(client_secret.to_owned()))
            .set_auth_uri(AuthUrl::new(
                config.auth_url.clone().unwrap_or(AUTH_URL.into()),
            )?)
            .set_token_uri(TokenUrl::new(
                config.token_url.clone().unwrap_or(TOKEN_URL.into()),
            )?)
            .set_redirect_uri(RedirectUrl::new(redirect)?);

        // Token exchange must never follow redirects.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            userinfo_url: Url::parse(
                config.userinfo_url.as_deref().unwrap_or(USERINFO_URL),
            )?,
            http,
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleOAuth {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn authorize_url(&self, state: &str) -> Url {
        let state = state.to_owned();
        let (url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .add_extra_param("access_type", "offline")
            .url();
        url
    }

    async fn exchange(&self, code: &str) -> Result<RemoteProfile, OAuthError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(&self.http)
            .await
            .map_err(|err| OAuthError::Exchange(err.to_string()))?;

        let profile = self
            .http
            .get(self.userinfo_url.clone())
            .bearer_auth(token.access_token().secret())
            .send()
            .await?
            .error_for_status()?
            .json::<RemoteProfile>()
            .await?;

        Ok(profile)
    }
}

/// Provider returning a fixed profile.
#[cfg(test)]
pub struct StubOAuth {
    pub profile: RemoteProfile,
    barrier: Option<std::sync::Arc<tokio::sync::Barrier>>,
}

#[cfg(test)]
impl StubOAuth {
    pub const CLIENT_ID: &'static str = "stub-client";

    pub fn new(profile: RemoteProfile) -> Self {
        Self {
            profile,
            barrier: None,
        }
    }

    /// Hold every exchange until `barrier` releases.
    pub fn with_barrier(
        mut self,
        barrier: std::sync::Arc<tokio::sync::Barrier>,
    ) -> Self {
        self.barrier = Some(barrier);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl OAuthProvider for StubOAuth {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn client_id(&self) -> &str {
        Self::CLIENT_ID
    }

    fn authorize_url(&self, state: &str) -> Url {
        let mut url = Url::parse("https://accounts.example.com/auth").unwrap();
        url.query_pairs_mut().append_pair("state", state);
        url
    }

    async fn exchange(&self, code: &str) -> Result<RemoteProfile, OAuthError> {
        if code != "valid-code" {
            return Err(OAuthError::Exchange("invalid_grant".into()));
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        Ok(self.profile.clone())
    }
}
