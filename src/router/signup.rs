//! Password account creation.

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
    #[validate(length(min = 3, max = 254, message = "Invalid email address."))]
    email: String,
    #[validate(length(
        min = 8,
        max = 64,
        message = "Password must be between 8 and 64 characters."
    ))]
    password: String,
}

/// Handler to create user.
pub async fn handler(
    State(state): State<AppState>,
    session: Session,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state.auth.signup(&body.email, &body.password).await?;
    log_in(&session, &user).await?;

    Ok((StatusCode::CREATED, Json(user)))
}
