//! Session-bound account management.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use validator::Validate;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::AppState;
use crate::error::Result;
use crate::router::{Message, TokenQuery, Valid, auth, confirm};
use crate::user::User;

#[derive(Debug, Serialize, Deserialize, Validate, Zeroize, ZeroizeOnDrop)]
pub struct PasswordBody {
    #[validate(length(min = 1, message = "Current password is required."))]
    current_password: String,
    #[validate(
        length(
            min = 8,
            max = 64,
            message = "Password must be between 8 and 64 characters."
        ),
        custom(function = "crate::password::validate_strength"),
        must_match(other = "password_confirmation", message = "Passwords do not match.")
    )]
    password: String,
    password_confirmation: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct EmailBody {
    #[validate(length(min = 3, max = 254, message = "Invalid email address."))]
    email: String,
}

/// Current session user.
pub async fn me(Extension(user): Extension<User>) -> Json<User> {
    Json(user)
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    session: Session,
    Valid(body): Valid<PasswordBody>,
) -> Result<Json<User>> {
    let user = state
        .auth
        .change_password(user.id, &body.current_password, &body.password)
        .await?;
    session.cycle_id().await?;

    Ok(Json(user))
}

pub async fn change_email(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Valid(body): Valid<EmailBody>,
) -> Result<Json<User>> {
    let user = state.auth.change_email(user.id, &body.email).await?;
    Ok(Json(user))
}

/// Email a deletion confirmation link.
pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<StatusCode> {
    state.auth.request_account_deletion(user.id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Consume a deletion link. Works without a session.
pub async fn confirm_delete(
    State(state): State<AppState>,
    session: Session,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Message>> {
    state.auth.confirm_account_deletion(&query.token).await?;
    session.flush().await?;

    Ok(Message::new("Account deleted."))
}

/// Routes requiring a logged in user.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/me", get(me))
        .route("/confirm-email/resend", post(confirm::resend))
        .route("/account/password", post(change_password))
        .route("/account/email", post(change_email))
        .route("/account/delete", post(delete))
        .route_layer(middleware::from_fn_with_state(state, auth))
}
