//! "Sign in with Google" endpoints.

use axum::extract::{Query, State};
use axum::response::Redirect;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Deserialize;
use tower_sessions::Session;

use crate::error::Result;
use crate::router::{GOOGLE_STATE_KEY, log_in};
use crate::{AppState, ServerError};

const STATE_LENGTH: usize = 32;

/// Send the browser to the consent page.
pub async fn redirect(
    State(state): State<AppState>,
    session: Session,
) -> Result<Redirect> {
    let provider = state.oauth.ok_or(ServerError::NotConfigured("google"))?;

    let csrf = Alphanumeric.sample_string(&mut OsRng, STATE_LENGTH);
    session.insert(GOOGLE_STATE_KEY, &csrf).await?;

    Ok(Redirect::to(provider.authorize_url(&csrf).as_str()))
}

#[derive(Debug, Deserialize)]
pub struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Consent page return. The `state` must match the one stored by
/// [`redirect`], which is consumed either way.
pub async fn callback(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<Callback>,
) -> Result<Redirect> {
    let provider = state.oauth.ok_or(ServerError::NotConfigured("google"))?;
    let expected = session.remove::<String>(GOOGLE_STATE_KEY).await?;

    if let Some(error) = &query.error {
        tracing::info!(%error, "consent refused by identity provider");
    }

    let (Some(code), Some(returned), Some(expected)) =
        (query.code, query.state, expected)
    else {
        return Err(ServerError::OAuthState);
    };
    if returned != expected {
        return Err(ServerError::OAuthState);
    }

    let user = state
        .auth
        .oauth_authenticate(provider.as_ref(), &code)
        .await?;
    log_in(&session, &user).await?;

    Ok(Redirect::to("/"))
}
