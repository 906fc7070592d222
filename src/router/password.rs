//! Forgotten password recovery.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use validator::Validate;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::AppState;
use crate::error::Result;
use crate::router::{Message, Valid};

pub const FORGOT_MESSAGE: &str =
    "If an account exists for this address, a reset link has been sent.";

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ForgotBody {
    #[validate(length(min = 3, max = 254, message = "Invalid email address."))]
    email: String,
}

/// Always answers with the same message, whether the account exists or not.
pub async fn forgot(
    State(state): State<AppState>,
    Valid(body): Valid<ForgotBody>,
) -> Result<Json<Message>> {
    state.auth.forgot_password(&body.email).await?;
    Ok(Message::new(FORGOT_MESSAGE))
}

#[derive(Debug, Serialize, Deserialize, Validate, Zeroize, ZeroizeOnDrop)]
pub struct ResetBody {
    #[validate(length(min = 1, message = "Token is required."))]
    token: String,
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

pub async fn reset(
    State(state): State<AppState>,
    Valid(body): Valid<ResetBody>,
) -> Result<Json<Message>> {
    let user = state
        .auth
        .reset_password(&body.token, &body.password)
        .await?;

    tracing::info!(user_id = %user.id, "password reset");
    Ok(Message::new("Password updated."))
}
