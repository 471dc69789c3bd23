use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DashMapStateStore,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

type KeyedLimiter =
    RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, StateInformationMiddleware>;

/// Rate limiter keyed by client IP. Cloning shares the bucket state.
#[derive(Clone)]
pub struct IpRateLimiter {
    limiter: Arc<KeyedLimiter>,
    limit: u32,
    period: Duration,
}

impl IpRateLimiter {
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Seconds until the bucket is full again given `remaining` cells.
    fn reset_after(&self, remaining: u32) -> u64 {
        let missing = self.limit.saturating_sub(remaining);
        (self.period * missing).as_secs_f64().ceil() as u64
    }
}

/// `attempts` requests per `window_seconds`, replenished evenly across the window.
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    let attempts = attempts.max(1);
    let period = Duration::from_millis((window_seconds * 1000) / attempts as u64);
    let burst = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst);

    IpRateLimiter {
        limiter: Arc::new(RateLimiter::dashmap(quota).with_middleware::<StateInformationMiddleware>()),
        limit: attempts,
        period,
    }
}

fn client_ip(request: &Request) -> Option<IpAddr> {
    let forwarded_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    forwarded_ip.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

fn insert_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset: u64) {
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(reset));
}

/// Middleware for IP-based rate limiting. Emits `X-RateLimit-*` headers on
/// every response and `Retry-After` on 429.
pub async fn ip_rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ip) = client_ip(&request) else {
        tracing::warn!("Could not determine IP for rate limiting");
        return next.run(request).await;
    };

    match limiter.limiter.check_key(&ip) {
        Ok(snapshot) => {
            let remaining = snapshot.remaining_burst_capacity();
            let mut response = next.run(request).await;
            insert_headers(
                response.headers_mut(),
                limiter.limit,
                remaining,
                limiter.reset_after(remaining),
            );
            response
        }
        Err(negative) => {
            let wait = negative.wait_time_from(DefaultClock::default().now());
            let retry_after = wait.as_secs_f64().ceil() as u64;
            tracing::warn!(client_ip = %ip, retry_after, "Rate limit exceeded");
            let mut response = AppError::TooManyRequests(
                "Too many requests. Please try again later.".to_string(),
                Some(retry_after),
            )
            .into_response();
            insert_headers(response.headers_mut(), limiter.limit, 0, retry_after);
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router, body::Body, http::StatusCode, middleware::from_fn_with_state, routing::post,
    };
    use tower::ServiceExt;

    fn app(limiter: IpRateLimiter) -> Router {
        Router::new()
            .route("/login", post(|| async { "ok" }))
            .layer(from_fn_with_state(limiter, ip_rate_limit_middleware))
    }

    fn request(ip: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn emits_headers_and_rejects_over_limit() {
        let limiter = create_ip_rate_limiter(2, 60);
        let app = app(limiter);

        let first = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[RATE_LIMIT_LIMIT_HEADER], "2");
        assert_eq!(first.headers()[RATE_LIMIT_REMAINING_HEADER], "1");

        let second = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[RATE_LIMIT_REMAINING_HEADER], "0");

        let third = app.clone().oneshot(request("10.0.0.1")).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(third.headers().contains_key(axum::http::header::RETRY_AFTER));
        assert_eq!(third.headers()[RATE_LIMIT_REMAINING_HEADER], "0");

        // other clients keep their own bucket
        let other = app.oneshot(request("10.0.0.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }
}
