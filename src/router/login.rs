//! Password login and logout.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use validator::Validate;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::AppState;
use crate::error::Result;
use crate::router::{Valid, log_in};
use crate::user::User;

#[derive(Debug, Serialize, Deserialize, Validate, Zeroize, ZeroizeOnDrop)]
pub struct Body {
    #[validate(length(min = 1, message = "Email is required."))]
    email: String,
    #[validate(length(min = 1, message = "Password is required."))]
    password: String,
}

/// Handler to log a user in.
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    Valid(body): Valid<Body>,
) -> Result<Json<User>> {
    let user = state.auth.login(&body.email, &body.password).await?;
    log_in(&session, &user).await?;

    Ok(Json(user))
}

/// Handler to end the session.
pub async fn logout(session: Session) -> Result<StatusCode> {
    session.flush().await?;
    Ok(StatusCode::NO_CONTENT)
}
