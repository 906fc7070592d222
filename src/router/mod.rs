//! HTTP handlers.
pub mod account;
pub mod confirm;
pub mod google;
pub mod login;
pub mod password;
pub mod signup;
pub mod status;

use axum::extract::{FromRequest, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::{Form, Json};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthError;
use crate::error::{Result, wants_json};
use crate::user::User;
use crate::{AppState, ServerError};

/// Session key holding the logged in user identifier.
pub const USER_ID_KEY: &str = "user_id";
/// Session key holding the pending Google OAuth `state`.
pub const GOOGLE_STATE_KEY: &str = "google_auth_state";

/// Form or JSON body, selected by `Content-Type`, then validated.
pub struct Valid<T>(pub T);

impl<S, T> FromRequest<S> for Valid<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate + Send,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let body = if wants_json(req.headers()) {
            Json::<T>::from_request(req, state)
                .await
                .map_err(|err| ServerError::ParsingForm(Box::new(err)))?
                .0
        } else {
            Form::<T>::from_request(req, state)
                .await
                .map_err(|err| ServerError::ParsingForm(Box::new(err)))?
                .0
        };

        body.validate()?;
        Ok(Valid(body))
    }
}

/// Query string carrying an emailed token.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: String,
}

/// Plain message response.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_owned(),
        })
    }
}

/// Bind `user` to a fresh session identifier.
pub async fn log_in(session: &Session, user: &User) -> Result<()> {
    session.cycle_id().await?;
    session.insert(USER_ID_KEY, user.id).await?;

    tracing::debug!(user_id = %user.id, "session opened");
    Ok(())
}

/// Custom middleware for authentification.
///
/// Loads the session user into request extensions. Sessions pointing to a
/// deleted account are flushed.
pub async fn auth(
    State(state): State<AppState>,
    session: Session,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let Some(user_id) = session.get::<Uuid>(USER_ID_KEY).await? else {
        return Err(ServerError::Unauthorized);
    };

    let user = match state.auth.user(user_id).await {
        Ok(user) => user,
        Err(AuthError::UserNotFound) => {
            session.flush().await?;
            return Err(ServerError::Unauthorized);
        },
        Err(err) => return Err(err.into()),
    };

    req.extensions_mut().insert::<User>(user);
    Ok(next.run(req).await)
}
