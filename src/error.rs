//! Error handler for hearth.

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::auth::AuthError;
use crate::auth::google::OAuthError;

pub type Result<T> = std::result::Result<T, ServerError>;

const INVALID_TOKEN: &str = "Invalid or expired token.";

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error("error parsing form data")]
    ParsingForm(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Session(#[from] tower_sessions::session::Error),

    #[error("authentication required")]
    Unauthorized,

    #[error("missing or mismatched OAuth state")]
    OAuthState,

    #[error("too many requests")]
    TooManyRequests,

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Structure for detailed error responses.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Render as a JSON problem document. The [`ResponseError`] rides along
    /// as an extension for [`negotiate`].
    pub fn into_response(self) -> Response {
        let Ok(body) = serde_json::to_string(&self) else {
            return internal_server_error();
        };

        let mut response = (
            self.status_code(),
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response();
        response.extensions_mut().insert(self);
        response
    }

    /// Render as a minimal HTML page.
    pub fn into_html(self) -> Response {
        let mut page = format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head><body><h1>{title}</h1><p>{detail}</p>",
            title = escape(&self.title),
            detail = escape(&self.detail),
        );
        if let Some(errors) = &self.errors {
            page.push_str("<ul>");
            for error in errors {
                page.push_str(&format!(
                    "<li><strong>{}</strong>: {}</li>",
                    escape(&error.field),
                    escape(&error.message)
                ));
            }
            page.push_str("</ul>");
        }
        page.push_str("</body></html>");

        (
            self.status_code(),
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            page,
        )
            .into_response()
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut fields: Vec<_> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| issue.to_string()),
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    fields
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn auth_response(err: &AuthError, response: ResponseError) -> ResponseError {
    match err {
        AuthError::Validation(errors) => response.errors(errors),
        AuthError::InvalidCredentials => response
            .title("Invalid credentials.")
            .details("Email or password is incorrect.")
            .status(StatusCode::UNAUTHORIZED),
        AuthError::DuplicateEmail => response
            .title("Email already used.")
            .details("An account already exists for this email address.")
            .status(StatusCode::CONFLICT),
        AuthError::UserNotFound => response
            .title("User not found.")
            .details("")
            .status(StatusCode::NOT_FOUND),
        AuthError::Token(_)
        | AuthError::TokenPurposeMismatch
        | AuthError::InvalidToken => {
            response.title(INVALID_TOKEN).details(INVALID_TOKEN)
        },
        AuthError::UnverifiedOAuthEmail => response
            .title("Unverified email.")
            .details("The identity provider did not confirm an email address."),
        AuthError::OAuth(OAuthError::Exchange(_)) => response
            .title("Authorization failed.")
            .details("The authorization code was refused."),
        AuthError::OAuth(err) => {
            tracing::error!(error = %err, "identity provider unreachable");
            response
                .title("Identity provider error.")
                .details("")
                .status(StatusCode::BAD_GATEWAY)
        },
        // Already logged by the workflow.
        AuthError::Internal { .. } => ResponseError::default(),
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Auth(err) => auth_response(err, response),

            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::ParsingForm(err) => response
                .title("Server error during data parsing.")
                .details(&err.to_string()),

            ServerError::Unauthorized => response
                .title("Authentication required.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::OAuthState => response.title("Invalid OAuth state."),

            ServerError::TooManyRequests => response
                .title("Too many requests.")
                .details("Try again in a minute.")
                .status(StatusCode::TOO_MANY_REQUESTS),

            ServerError::NotConfigured(_) => response
                .title("Not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Session(err) => {
                tracing::error!(error = %err, "session store failed");

                ResponseError::default()
            },
        };

        response.into_response()
    }
}

/// Whether the request body is `application/json`, in any letter case.
pub(crate) fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value.to_ascii_lowercase().contains("application/json")
        })
}

/// Render error responses as HTML unless the request body was JSON.
pub async fn negotiate(req: Request, next: Next) -> Response {
    let json = wants_json(req.headers());
    let mut response = next.run(req).await;

    if json {
        return response;
    }
    match response.extensions_mut().remove::<ResponseError>() {
        Some(error) => error.into_html(),
        None => response,
    }
}

fn internal_server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/problem+json")],
        serde_json::json!({
            "type": null,
            "title": "Internal server error.",
            "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            "detail": null,
            "instance": null,
            "errors": null,
        })
        .to_string(),
    )
        .into_response()
}
