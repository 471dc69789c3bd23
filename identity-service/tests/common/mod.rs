//! Shared setup for router-level tests. Everything runs in memory: the
//! identity store, trust cache, inbox and mailbox.

#![allow(dead_code)]

use http_body_util::BodyExt;
use identity_service::{
    build_router,
    config::{
        AuthSettings, BootstrapConfig, CacheBackend, DatabaseConfig, Environment,
        IdempotencyConfig, IdentityConfig, InboxBackend, InboxConfig, JwtConfig, OutboxConfig,
        RateLimitConfig, RbacConfig, RedisConfig, SecurityConfig, SmtpConfig, StoreBackend,
    },
    services::{
        bootstrap, email::EmailKind, policy::PasswordPolicy, InMemoryCache, MemoryStore,
        MockEmailService,
    },
    AppState,
};
use serde_json::{json, Value};
use service_core::axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

pub const ADMIN_EMAIL: &str = "admin@ex.com";
pub const ADMIN_PASSWORD: &str = "Adm1nPassw0rd";

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: String::new(),
            max_connections: 1,
            min_connections: 0,
            acquire_timeout_seconds: 1,
        },
        redis: RedisConfig {
            backend: CacheBackend::Memory,
            url: String::new(),
        },
        jwt: JwtConfig {
            secret: "test-secret-key-that-is-long-enough-0123".to_string(),
            issuer: "identity-service".to_string(),
            audience: "identity-api".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            leeway_seconds: 0,
        },
        smtp: SmtpConfig {
            host: None,
            port: 587,
            username: String::new(),
            password: String::new(),
            from_address: "Identity <no-reply@localhost>".to_string(),
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            expose_error_details: true,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 1000,
            login_window_seconds: 60,
            register_attempts: 1000,
            register_window_seconds: 60,
            password_reset_attempts: 1000,
            password_reset_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
        auth: AuthSettings {
            password_policy: PasswordPolicy::Standard,
            require_email_verification: false,
            public_base_url: "http://localhost:8080".to_string(),
        },
        outbox: OutboxConfig {
            max_retries: 3,
            retry_delay_seconds: 1,
            workers: 1,
            poll_interval_ms: 10,
            batch_size: 50,
            cleanup_after_days: 7,
            stale_claim_seconds: 300,
        },
        idempotency: IdempotencyConfig {
            ttl_seconds: 3600,
            required_routes: Vec::new(),
        },
        inbox: InboxConfig {
            backend: InboxBackend::Database,
        },
        rbac: RbacConfig {
            admin_roles: vec!["admin".to_string()],
            maintenance_interval_seconds: 60,
        },
        bootstrap: BootstrapConfig {
            admin_email: Some(ADMIN_EMAIL.to_string()),
            admin_password: Some(ADMIN_PASSWORD.to_string()),
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<InMemoryCache>,
    pub email: MockEmailService,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestResponse {
    pub fn data(&self) -> &Value {
        &self.body["data"]
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: IdentityConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let email = MockEmailService::new();

        let bootstrap_config = config.bootstrap.clone();
        let state = AppState::new(
            config,
            store.clone(),
            cache.clone(),
            store.clone(),
            Arc::new(email.clone()),
        )
        .expect("state");
        bootstrap::seed(&state.roles, &state.users, "admin", &bootstrap_config)
            .await
            .expect("seed");

        let router = build_router(state.clone()).expect("router");
        Self {
            router,
            state,
            store,
            cache,
            email,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        TestResponse { status, body }
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        self.send(build_request(method, uri, token, body, None)).await
    }

    pub async fn register(&self, email: &str, password: &str, name: &str) -> TestResponse {
        self.call(
            Method::POST,
            "/api/v1/auth/register",
            None,
            Some(json!({ "email": email, "password": password, "name": name })),
        )
        .await
    }

    pub async fn login(&self, email: &str, password: &str) -> TestResponse {
        self.call(
            Method::POST,
            "/api/v1/auth/login",
            None,
            Some(json!({ "email": email, "password": password })),
        )
        .await
    }

    /// Logs in and returns the access token.
    pub async fn access_token(&self, email: &str, password: &str) -> String {
        let res = self.login(email, password).await;
        assert_eq!(res.status, StatusCode::OK, "login failed: {}", res.body);
        res.data()["tokens"]["access_token"]
            .as_str()
            .expect("access token")
            .to_string()
    }

    pub async fn admin_token(&self) -> String {
        self.access_token(ADMIN_EMAIL, ADMIN_PASSWORD).await
    }

    /// Registers a user and returns `(user_id, access_token)`.
    pub async fn user(&self, email: &str, password: &str) -> (String, String) {
        let res = self.register(email, password, "Test User").await;
        assert_eq!(res.status, StatusCode::CREATED, "register failed: {}", res.body);
        (
            res.data()["user"]["id"].as_str().expect("id").to_string(),
            res.data()["tokens"]["access_token"]
                .as_str()
                .expect("token")
                .to_string(),
        )
    }

    pub fn last_mail_token(&self, to: &str, kind: EmailKind) -> String {
        self.email.last_token(to, kind).expect("mail was sent")
    }
}

pub fn build_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
    idempotency_key: Option<&str>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(key) = idempotency_key {
        builder = builder.header("idempotency-key", key);
    }
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("request")
}
