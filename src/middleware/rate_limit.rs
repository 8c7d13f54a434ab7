use axum::{
    extract::{connect_info::ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ApiConfig;

const CLEANUP_THRESHOLD: usize = 10_000;
const MAX_WINDOW: Duration = Duration::from_secs(86_400);

#[derive(Clone)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter per client IP.
#[derive(Clone)]
pub struct RateLimiter {
    limits: Arc<RwLock<HashMap<String, RateLimitEntry>>>,
    max_requests: u32,
    window: Duration,
    trust_x_forwarded_for: bool,
}

impl RateLimiter {
    /// Windows longer than a day are clamped to one day.
    pub fn new(max_requests: u32, window: Duration, trust_x_forwarded_for: bool) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window: window.min(MAX_WINDOW),
            trust_x_forwarded_for,
        }
    }

    /// Limiter for one route group, sharing the configured window and proxy trust.
    pub fn from_config(config: &ApiConfig, max_requests: u32) -> Self {
        Self::new(max_requests, config.rate_limit_window, config.trust_x_forwarded_for)
    }

    /// When 0, rate limiting is disabled.
    pub fn is_disabled(&self) -> bool {
        self.max_requests == 0
    }

    pub async fn check_limit(&self, key: &str) -> Result<(), StatusCode> {
        let mut limits = self.limits.write().await;
        let now = Instant::now();

        if limits.len() > CLEANUP_THRESHOLD {
            limits.retain(|_, entry| entry.reset_at > now);
        }

        let reset_at = now.checked_add(self.window).unwrap_or(now);
        match limits.get_mut(key) {
            Some(entry) if entry.reset_at <= now => {
                entry.count = 1;
                entry.reset_at = reset_at;
                Ok(())
            }
            Some(entry) if entry.count >= self.max_requests => Err(StatusCode::TOO_MANY_REQUESTS),
            Some(entry) => {
                entry.count += 1;
                Ok(())
            }
            None => {
                limits.insert(
                    key.to_string(),
                    RateLimitEntry { count: 1, reset_at },
                );
                Ok(())
            }
        }
    }
}

/// Client IP: first `X-Forwarded-For` hop when trusted, else the peer address.
pub fn client_ip(req: &Request, trust_x_forwarded_for: bool) -> String {
    if trust_x_forwarded_for {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(State(rate_limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    if rate_limiter.is_disabled() {
        return next.run(req).await;
    }

    let ip = client_ip(&req, rate_limiter.trust_x_forwarded_for);
    if let Err(status) = rate_limiter.check_limit(&ip).await {
        tracing::warn!("Rate limit exceeded: {} {} client={}", req.method(), req.uri().path(), ip);
        let body = serde_json::json!({"error": "Too many requests"});
        return (status, Json(body)).into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tokio_test::assert_ok;

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60), false);
        assert_ok!(limiter.check_limit("1.2.3.4").await);
        assert_ok!(limiter.check_limit("1.2.3.4").await);
        assert_eq!(limiter.check_limit("1.2.3.4").await, Err(StatusCode::TOO_MANY_REQUESTS));
        assert_ok!(limiter.check_limit("5.6.7.8").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_ok!(limiter.check_limit("1.2.3.4").await);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_window_is_clamped_instead_of_overflowing() {
        let limiter = RateLimiter::new(1, Duration::MAX, false);
        assert_ok!(limiter.check_limit("1.2.3.4").await);
        assert_eq!(limiter.check_limit("1.2.3.4").await, Err(StatusCode::TOO_MANY_REQUESTS));

        tokio::time::advance(MAX_WINDOW + Duration::from_secs(1)).await;
        assert_ok!(limiter.check_limit("1.2.3.4").await);
    }

    #[test]
    fn forwarded_header_only_when_trusted() {
        let req = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, true), "203.0.113.9");
        assert_eq!(client_ip(&req, false), "unknown");
    }
}
