//! HTTP idempotency gate over the inbox. A repeated `Idempotency-Key` on
//! the same method, path and query is refused with 409; nothing is replayed.

use service_core::axum::{
    extract::{MatchedPath, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::{config::IdempotencyConfig, services::InboxService};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const HTTP_CONSUMER_ID: &str = "http-api";
const MAX_KEY_LENGTH: usize = 255;

/// What the gate recorded for the current request.
#[derive(Debug, Clone)]
pub struct IdempotencyContext {
    pub key: String,
    pub message_id: Uuid,
    pub event_type: String,
}

#[derive(Clone)]
pub struct IdempotencyGate {
    inbox: InboxService,
    ttl_seconds: u64,
    /// `"<METHOD> <route pattern>"` entries that must carry a key.
    required: Arc<HashSet<String>>,
}

impl IdempotencyGate {
    pub fn new(inbox: InboxService, config: &IdempotencyConfig) -> Self {
        Self {
            inbox,
            ttl_seconds: config.ttl_seconds,
            required: Arc::new(
                config
                    .required_routes
                    .iter()
                    .map(|r| normalize_route(r))
                    .collect(),
            ),
        }
    }

    fn is_required(&self, method: &Method, route: &str) -> bool {
        self.required.contains(&format!("{} {}", method, route))
    }
}

fn normalize_route(route: &str) -> String {
    let mut parts = route.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => format!("{} {}", method.to_uppercase(), path),
        _ => route.trim().to_string(),
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// `UUIDv5(nil, sha256(key ‖ method ‖ path ‖ raw_query))`.
pub fn derive_message_id(key: &str, method: &Method, path: &str, raw_query: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(method.as_str().as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(raw_query.as_bytes());
    Uuid::new_v5(&Uuid::nil(), &hasher.finalize())
}

pub fn event_type_for(method: &Method, route: &str) -> String {
    format!("http.{}.{}", method, route)
}

pub async fn idempotency_middleware(
    State(gate): State<IdempotencyGate>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let method = req.method().clone();
    if !is_mutating(&method) {
        return Ok(next.run(req).await);
    }

    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let key = match req.headers().get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => value
            .to_str()
            .ok()
            .map(str::trim)
            .filter(|k| !k.is_empty() && k.len() <= MAX_KEY_LENGTH)
            .ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!(
                    "Idempotency-Key must be 1-{} visible characters",
                    MAX_KEY_LENGTH
                ))
            })?
            .to_string(),
        None if gate.is_required(&method, &route) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Idempotency-Key header is required for {} {}",
                method,
                route
            )));
        }
        None => return Ok(next.run(req).await),
    };

    let raw_query = req.uri().query().unwrap_or_default();
    let message_id = derive_message_id(&key, &method, &path, raw_query);
    let event_type = event_type_for(&method, &route);

    let first = gate
        .inbox
        .process_with_dedup(message_id, &event_type, HTTP_CONSUMER_ID, gate.ttl_seconds)
        .await?;
    if !first {
        tracing::info!(message_id = %message_id, event_type = %event_type, "Duplicate request refused");
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Request with this Idempotency-Key was already processed"
        )));
    }

    req.extensions_mut().insert(IdempotencyContext {
        key,
        message_id,
        event_type,
    });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryCache, CacheInboxStore};
    use http_body_util::BodyExt;
    use service_core::axum::{
        body::Body,
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    #[test]
    fn test_message_id_is_stable_and_sensitive() {
        let a = derive_message_id("k1", &Method::POST, "/api/v1/users", "");
        assert_eq!(a, derive_message_id("k1", &Method::POST, "/api/v1/users", ""));
        assert_ne!(a, derive_message_id("k2", &Method::POST, "/api/v1/users", ""));
        assert_ne!(a, derive_message_id("k1", &Method::PUT, "/api/v1/users", ""));
        assert_ne!(a, derive_message_id("k1", &Method::POST, "/api/v1/users", "x=1"));
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_event_type_uses_route_pattern() {
        assert_eq!(
            event_type_for(&Method::POST, "/api/v1/users/:id/roles"),
            "http.POST./api/v1/users/:id/roles"
        );
    }

    fn app(required: &[&str]) -> Router {
        let inbox = InboxService::new(Arc::new(CacheInboxStore::new(Arc::new(
            InMemoryCache::new(),
        ))));
        let gate = IdempotencyGate::new(
            inbox,
            &IdempotencyConfig {
                ttl_seconds: 60,
                required_routes: required.iter().map(|s| s.to_string()).collect(),
            },
        );
        Router::new()
            .route(
                "/api/v1/things",
                post(|| async { "created" }).get(|| async { "listed" }),
            )
            .layer(from_fn_with_state(gate, idempotency_middleware))
    }

    fn request(method: &str, key: Option<&str>) -> Request {
        let mut builder = Request::builder().method(method).uri("/api/v1/things");
        if let Some(key) = key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_key_is_refused() {
        let app = app(&[]);

        let first = app.clone().oneshot(request("POST", Some("abc"))).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(request("POST", Some("abc"))).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = second.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "CONFLICT");

        let other = app.clone().oneshot(request("POST", Some("def"))).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);

        // reads and keyless writes pass through
        assert_eq!(app.clone().oneshot(request("GET", Some("abc"))).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(request("POST", None)).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_required_route_needs_key() {
        let app = app(&["post /api/v1/things"]);
        let missing = app.clone().oneshot(request("POST", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let keyed = app.oneshot(request("POST", Some("k"))).await.unwrap();
        assert_eq!(keyed.status(), StatusCode::OK);
    }
}
