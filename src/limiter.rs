//! Per client IP request limiting for credential endpoints.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config;
use crate::error::Result;
use crate::{AppState, ServerError};

/// Keyed limiter shared by every rate limited route.
#[derive(Clone)]
pub struct Limiter {
    buckets: Option<Arc<DefaultKeyedRateLimiter<IpAddr>>>,
    trust_proxy: bool,
}

impl Limiter {
    /// Create a new [`Limiter`]. A zero `per_minute` disables limiting.
    pub fn new(config: &config::RateLimit) -> Self {
        Self {
            buckets: NonZeroU32::new(config.per_minute)
                .map(|quota| Arc::new(RateLimiter::keyed(Quota::per_minute(quota)))),
            trust_proxy: config.trust_proxy,
        }
    }

    /// Client address: the first `X-Forwarded-For` hop, then `X-Real-IP`
    /// when proxies are trusted, else the peer address.
    fn client_ip(&self, req: &Request) -> Option<IpAddr> {
        if self.trust_proxy {
            if let Some(ip) = forwarded_ip(req.headers()) {
                return Some(ip);
            }
        }

        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    }

    /// Whether `ip` may issue one more request now.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.buckets
            .as_ref()
            .is_none_or(|buckets| buckets.check_key(&ip).is_ok())
    }

    /// Drop idle buckets every `period`.
    pub async fn purge_every(self, period: Duration) {
        let Some(buckets) = self.buckets else {
            return;
        };

        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            buckets.retain_recent();
            tracing::trace!(clients = buckets.len(), "rate limit buckets purged");
        }
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
    };

    header("x-forwarded-for").or_else(|| header("x-real-ip"))
}

/// Refuse requests once the client exhausted its quota.
pub async fn limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response> {
    match state.limiter.client_ip(&req) {
        Some(ip) if !state.limiter.check(ip) => {
            tracing::info!(%ip, path = req.uri().path(), "rate limit exceeded");
            Err(ServerError::TooManyRequests)
        },
        Some(_) => Ok(next.run(req).await),
        None => {
            tracing::debug!("no client address, request not rate limited");
            Ok(next.run(req).await)
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, StatusCode, header};
    use tower::util::ServiceExt;

    use super::*;
    use crate::router::tests::{FORM, json};
    use crate::{test_app, test_state};

    fn limiter(per_minute: u32, trust_proxy: bool) -> Limiter {
        Limiter::new(&config::RateLimit {
            per_minute,
            trust_proxy,
        })
    }

    fn request(peer: [u8; 4], forwarded: Option<&str>) -> Request {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header(header::CONTENT_TYPE, FORM.unwrap_or_default())
            .extension(ConnectInfo(SocketAddr::from((peer, 4000))));
        if let Some(forwarded) = forwarded {
            request = request.header("x-forwarded-for", forwarded);
        }
        request
            .body(Body::from("email=john%40gmail.com&password=Wrong1234"))
            .unwrap()
    }

    #[test]
    fn test_quota_is_per_client() {
        let limiter = limiter(2, false);
        let first = IpAddr::from([10, 0, 0, 1]);
        let second = IpAddr::from([10, 0, 0, 2]);

        assert!(limiter.check(first));
        assert!(limiter.check(first));
        assert!(!limiter.check(first));
        assert!(limiter.check(second));
    }

    #[test]
    fn test_zero_quota_disables() {
        let limiter = limiter(0, false);
        let ip = IpAddr::from([10, 0, 0, 1]);

        assert!((0..100).all(|_| limiter.check(ip)));
    }

    #[test]
    fn test_client_ip() {
        let direct = limiter(1, false);
        let proxied = limiter(1, true);
        let req = request([10, 0, 0, 1], Some("203.0.113.9, 10.0.0.1"));

        assert_eq!(direct.client_ip(&req), Some(IpAddr::from([10, 0, 0, 1])));
        assert_eq!(proxied.client_ip(&req), Some(IpAddr::from([203, 0, 113, 9])));

        let req = request([10, 0, 0, 1], Some("garbage"));
        assert_eq!(proxied.client_ip(&req), Some(IpAddr::from([10, 0, 0, 1])));
    }

    #[tokio::test]
    async fn test_login_is_limited() {
        let (mut state, _) = test_state(None);
        state.limiter = limiter(2, false);
        let app = test_app(state);

        for _ in 0..2 {
            let response = app.clone().oneshot(request([10, 0, 0, 1], None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app.clone().oneshot(request([10, 0, 0, 1], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let mut json_request = request([10, 0, 0, 1], None);
        json_request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        *json_request.body_mut() = Body::from(r#"{"email":"a@gmail.com","password":"x"}"#);
        let response = app.clone().oneshot(json_request).await.unwrap();
        assert_eq!(json(response).await["status"], 429);

        let response = app.oneshot(request([10, 0, 0, 2], None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
