mod common;

use common::{build_request, test_config, TestApp};
use identity_service::middleware::{idempotency_middleware, IdempotencyGate};
use serde_json::json;
use service_core::axum::{
    http::{Method, StatusCode},
    middleware::from_fn_with_state,
    routing::post,
    Router,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tower::ServiceExt;

#[tokio::test]
async fn test_concurrent_duplicates_run_the_handler_once() {
    let app = TestApp::spawn().await;
    let calls = Arc::new(AtomicUsize::new(0));

    let gate = IdempotencyGate::new(app.state.inbox.clone(), &test_config().idempotency);
    let counter = calls.clone();
    let orders = Router::new()
        .route(
            "/api/v1/orders",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    (StatusCode::CREATED, "created")
                }
            }),
        )
        .route_layer(from_fn_with_state(gate, idempotency_middleware));

    let send = || {
        orders.clone().oneshot(build_request(
            Method::POST,
            "/api/v1/orders",
            None,
            Some(json!({ "sku": "A-1" })),
            Some("order-42"),
        ))
    };
    let (first, second) = tokio::join!(send(), send());
    let mut statuses = vec![first.unwrap().status(), second.unwrap().status()];
    statuses.sort();

    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_key_on_api_route_is_refused() {
    let app = TestApp::spawn().await;
    let body = json!({ "email": "alice@ex.com", "password": "P@ssw0rd", "name": "Alice" });

    let first = app
        .send(build_request(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(body.clone()),
            Some("signup-1"),
        ))
        .await;
    assert_eq!(first.status, StatusCode::CREATED);

    let replay = app
        .send(build_request(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(body),
            Some("signup-1"),
        ))
        .await;
    assert_eq!(replay.status, StatusCode::CONFLICT);
    assert_eq!(replay.body["error"]["code"], "CONFLICT");
    assert!(replay.body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Idempotency-Key"));

    let fresh = app
        .send(build_request(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(json!({ "email": "bob@ex.com", "password": "B0bPassword", "name": "Bob" })),
            Some("signup-2"),
        ))
        .await;
    assert_eq!(fresh.status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_same_key_on_different_paths_is_independent() {
    let app = TestApp::spawn().await;
    let (alice_id, alice) = app.user("alice@ex.com", "P@ssw0rd").await;

    let rename = |name: &str| {
        build_request(
            Method::PATCH,
            &format!("/api/v1/users/{}", alice_id),
            Some(&alice),
            Some(json!({ "name": name })),
            Some("shared-key"),
        )
    };
    assert_eq!(app.send(rename("Alice A.")).await.status, StatusCode::OK);
    assert_eq!(app.send(rename("Alice B.")).await.status, StatusCode::CONFLICT);

    let logout = app
        .send(build_request(
            Method::POST,
            "/api/v1/auth/logout",
            Some(&alice),
            None,
            Some("shared-key"),
        ))
        .await;
    assert_eq!(logout.status, StatusCode::OK);
}

#[tokio::test]
async fn test_reads_ignore_the_key() {
    let app = TestApp::spawn().await;
    let (alice_id, alice) = app.user("alice@ex.com", "P@ssw0rd").await;
    let uri = format!("/api/v1/users/{}", alice_id);

    for _ in 0..2 {
        let res = app
            .send(build_request(Method::GET, &uri, Some(&alice), None, Some("read-key")))
            .await;
        assert_eq!(res.status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_configured_route_requires_a_key() {
    let mut config = test_config();
    config.idempotency.required_routes = vec!["POST /api/v1/users".to_string()];
    let app = TestApp::with_config(config).await;
    let admin = app.admin_token().await;
    let body = json!({ "email": "erin@ex.com", "name": "Erin", "password": "Er1nPassword" });

    let missing = app
        .call(Method::POST, "/api/v1/users", Some(&admin), Some(body.clone()))
        .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);

    let keyed = app
        .send(build_request(
            Method::POST,
            "/api/v1/users",
            Some(&admin),
            Some(body),
            Some("create-erin"),
        ))
        .await;
    assert_eq!(keyed.status, StatusCode::CREATED);
}
