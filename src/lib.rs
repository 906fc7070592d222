//! Hearth is a session-based account manager for server-rendered web apps.
#![forbid(unsafe_code)]

mod auth;
mod clock;
pub mod config;
mod crypto;
mod database;
mod email;
pub mod error;
mod limiter;
mod mail;
mod password;
mod router;
pub mod telemetry;
mod token;
mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::{
    SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};
use tower_sessions::cookie::SameSite;
use tower_sessions::cookie::time::Duration as CookieDuration;
use tower_sessions::{Expiry, SessionManagerLayer, SessionStore};
use tower_sessions_sqlx_store::PostgresStore;

use auth::google::{GoogleOAuth, OAuthProvider};
use auth::{AuthService, TokenTtl};
use error::ServerError;
pub use limiter::Limiter;

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    content_type: Option<&str>,
    cookie: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder().method(method).uri(path);
    if let Some(content_type) = content_type {
        request = request.header(header::CONTENT_TYPE, content_type);
    }
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub auth: AuthService,
    pub oauth: Option<Arc<dyn OAuthProvider>>,
    pub metrics: Option<PrometheusHandle>,
    pub limiter: Limiter,
}

/// Cookie session layer over `store`.
pub fn session_layer<S: SessionStore>(
    store: S,
    config: &config::Session,
) -> SessionManagerLayer<S> {
    SessionManagerLayer::new(store)
        .with_name(config.name.clone())
        .with_secure(config.secure)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(CookieDuration::days(
            config.inactivity_days,
        )))
}

/// Create router.
pub fn app<S: SessionStore + Clone>(
    state: AppState,
    sessions: SessionManagerLayer<S>,
) -> Router {
    let sensitive = [header::AUTHORIZATION, header::COOKIE, header::SET_COOKIE];
    let middleware = ServiceBuilder::new()
        // Mask sensitive request headers before the request span records them.
        .layer(SetSensitiveRequestHeadersLayer::new(sensitive.clone()))
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Mask sensitive response headers before the trace layer logs them.
        .layer(SetSensitiveResponseHeadersLayer::new(sensitive))
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("deny"),
        ))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );

    let limited = Router::new()
        .route("/signup", post(router::signup::handler))
        .route("/login", post(router::login::login))
        .route("/forgot-password", post(router::password::forgot))
        .route("/reset-password", post(router::password::reset))
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            limiter::limit,
        ));

    Router::new()
        .route("/health", get(router::status::health))
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .route("/metrics", get(router::status::metrics))
        .route("/logout", post(router::login::logout))
        .route("/confirm-email", get(router::confirm::confirm))
        .route("/account/delete/confirm", get(router::account::confirm_delete))
        .route("/login/google", get(router::google::redirect))
        .route("/login/google/callback", get(router::google::callback))
        .merge(limited)
        .merge(router::account::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(AxumMiddleware::from_fn(error::negotiate))
        .layer(sessions)
        .layer(middleware)
}

/// Initialize the application state and the session store.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    secrets: &config::Secrets,
    metrics: Option<PrometheusHandle>,
) -> Result<(AppState, PostgresStore), Box<dyn std::error::Error>> {
    let url = match (&secrets.database_url, &config.postgres) {
        (Some(url), _) => url.clone(),
        (None, Some(postgres)) => database::url_from_config(postgres),
        (None, None) => {
            return Err(format!(
                "missing `postgres` entry on `config.yaml` file or `{}` environment variable",
                config::DATABASE_URL_ENV
            )
            .into());
        },
    };
    let pool = database::connect(
        &url,
        config.postgres.as_ref().and_then(|p| p.pool_size),
    )
    .await?;

    let sessions = PostgresStore::new(pool.clone());
    sessions.migrate().await?;

    // handle mail sender.
    let base_url = url::Url::parse(&config.url)?;
    let mailer: Arc<dyn mail::Mailer> = match &config.mail {
        Some(cfg) => Arc::new(mail::QueueMailer::new(cfg, base_url).await?),
        None => {
            tracing::warn!("missing `mail` entry on `config.yaml` file, mails are only logged");
            Arc::new(mail::LogMailer)
        },
    };

    let oauth: Option<Arc<dyn OAuthProvider>> =
        match (&config.google, &secrets.google_client_secret) {
            (Some(google), Some(secret)) => Some(Arc::new(GoogleOAuth::new(
                google,
                secret,
                config.absolute_url("login/google/callback")?,
            )?)),
            (Some(_), None) => {
                tracing::warn!(
                    "`google` configured without `{}`, social login disabled",
                    config::GOOGLE_SECRET_ENV
                );
                None
            },
            _ => None,
        };

    let auth = AuthService::new(
        Arc::new(user::PgUserDirectory::new(pool)),
        mailer,
        email::EmailValidator::new(Arc::new(email::DnsResolver::new())),
        crypto::PasswordManager::new(config.argon2.clone())?,
        token::VerificationTokens::new(
            secrets.token_secret.clone(),
            Arc::new(clock::SystemClock),
        ),
        TokenTtl::from(&config.token),
    );

    let limiter = Limiter::new(&config.rate_limit);

    Ok((
        AppState {
            config,
            auth,
            oauth,
            metrics,
            limiter,
        },
        sessions,
    ))
}

/// In-memory state for router tests.
#[cfg(test)]
pub(crate) fn test_state(
    oauth: Option<Arc<dyn OAuthProvider>>,
) -> (AppState, auth::Harness) {
    let harness = auth::Harness::new();
    let config = config::Configuration::default();
    let state = AppState {
        limiter: Limiter::new(&config.rate_limit),
        config: Arc::new(config),
        auth: harness.service.clone(),
        oauth,
        metrics: None,
    };
    (state, harness)
}

/// Router over [`test_state`] with an in-memory session store.
#[cfg(test)]
pub(crate) fn test_app(state: AppState) -> Router {
    let sessions = session_layer(
        tower_sessions::MemoryStore::default(),
        &config::Session::default(),
    );
    app(state, sessions)
}
