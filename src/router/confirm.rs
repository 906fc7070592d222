//! Email address confirmation.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::AppState;
use crate::error::Result;
use crate::router::{Message, TokenQuery};
use crate::user::User;

/// Consume an emailed verification link.
pub async fn confirm(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Message>> {
    state.auth.verify_email(&query.token).await?;
    Ok(Message::new("Email confirmed."))
}

/// Send a new verification link to the session user.
pub async fn resend(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
) -> Result<StatusCode> {
    state.auth.resend_verification(user.id).await?;
    Ok(StatusCode::ACCEPTED)
}
