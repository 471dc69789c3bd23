pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;
pub mod workers;

use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{delete, get, post, put, MethodRouter},
    Json, Router,
};
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{openapi::security::SecurityScheme, Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::IdentityConfig;
use crate::middleware::{
    auth_middleware, authorize, idempotency_middleware, AccessRule, AuthorizationGate,
    IdempotencyGate,
};
use crate::services::{
    inbox::InboxStore, AuthService, EmailProvider, IdentityStore, InboxService, JwtService,
    RbacEvaluator, RoleService, TrustCache, UserService,
};
use service_core::error::AppError;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::metrics::metrics,
        handlers::auth::registration::register,
        handlers::auth::registration::verify_email,
        handlers::auth::registration::resend_verification,
        handlers::auth::session::login,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::auth::session::logout_all,
        handlers::auth::session::me,
        handlers::auth::password::request_password_reset,
        handlers::auth::password::confirm_password_reset,
        handlers::user::list_users,
        handlers::user::create_user,
        handlers::user::get_user,
        handlers::user::update_user,
        handlers::user::delete_user,
        handlers::user::change_password,
        handlers::user::activate_user,
        handlers::user::deactivate_user,
        handlers::user::user_roles,
        handlers::user::user_permissions,
        handlers::user::assign_role,
        handlers::user::unassign_role,
        handlers::role::list_roles,
        handlers::role::create_role,
        handlers::role::get_role,
        handlers::role::update_role,
        handlers::role::delete_role,
        handlers::role::grant_permissions,
        handlers::role::revoke_permission,
        handlers::permission::list_permissions,
        handlers::permission::create_permission,
        handlers::permission::get_permission,
        handlers::permission::update_permission,
        handlers::permission::delete_permission,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::ErrorDetail,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::AuthResponse,
            dtos::auth::LoginRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::PasswordResetRequest,
            dtos::auth::PasswordResetConfirm,
            dtos::auth::ResendVerificationRequest,
            dtos::auth::ChangePasswordRequest,
            dtos::user::CreateUserRequest,
            dtos::user::UpdateUserRequest,
            dtos::user::AssignRoleRequest,
            dtos::user::UserListResponse,
            dtos::user::UserRolesResponse,
            dtos::role::CreateRoleRequest,
            dtos::role::UpdateRoleRequest,
            dtos::role::GrantPermissionsRequest,
            dtos::role::GrantResponse,
            dtos::role::RoleDetailResponse,
            dtos::role::RoleListResponse,
            dtos::role::CreatePermissionRequest,
            dtos::role::UpdatePermissionRequest,
            dtos::role::PermissionListResponse,
            services::TokenResponse,
            services::EffectivePermission,
            models::UserResponse,
            models::UserState,
            models::RoleResponse,
            models::PermissionResponse,
            models::UserRoleAssignment,
            models::SortOrder,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Registration, sessions and account recovery"),
        (name = "Users", description = "User administration and role assignment"),
        (name = "Roles", description = "Roles and their permission grants"),
        (name = "Permissions", description = "Permission catalogue"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub store: Arc<dyn IdentityStore>,
    pub cache: Arc<dyn TrustCache>,
    pub auth: AuthService,
    pub users: UserService,
    pub roles: RoleService,
    pub rbac: RbacEvaluator,
    pub inbox: InboxService,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub password_reset_rate_limiter: IpRateLimiter,
    pub verification_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wires the services over already-connected backends.
    pub fn new(
        config: IdentityConfig,
        store: Arc<dyn IdentityStore>,
        cache: Arc<dyn TrustCache>,
        inbox_store: Arc<dyn InboxStore>,
        email: Arc<dyn EmailProvider>,
    ) -> Result<Self, AppError> {
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;
        let max_retries = config.outbox.max_retries;
        let rl = &config.rate_limit;

        Ok(Self {
            auth: AuthService::new(
                store.clone(),
                cache.clone(),
                email,
                jwt,
                config.auth.clone(),
                max_retries,
            ),
            users: UserService::new(store.clone(), config.auth.password_policy, max_retries),
            roles: RoleService::new(store.clone(), max_retries),
            rbac: RbacEvaluator::new(store.clone()),
            inbox: InboxService::new(inbox_store),
            login_rate_limiter: create_ip_rate_limiter(rl.login_attempts, rl.login_window_seconds),
            register_rate_limiter: create_ip_rate_limiter(
                rl.register_attempts,
                rl.register_window_seconds,
            ),
            password_reset_rate_limiter: create_ip_rate_limiter(
                rl.password_reset_attempts,
                rl.password_reset_window_seconds,
            ),
            verification_rate_limiter: create_ip_rate_limiter(
                rl.password_reset_attempts,
                rl.password_reset_window_seconds,
            ),
            ip_rate_limiter: create_ip_rate_limiter(
                rl.global_ip_limit,
                rl.global_ip_window_seconds,
            ),
            store,
            cache,
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    let gate = AuthorizationGate::new(
        state.rbac.clone(),
        Arc::new(state.config.rbac.admin_roles.clone()),
        Default::default(),
    );
    let guard = |rules: Vec<AccessRule>| from_fn_with_state(gate.admin_or(rules), authorize);
    let permission = |resource: &str, action: &str| {
        vec![AccessRule::Permission {
            resource: resource.to_string(),
            action: action.to_string(),
        }]
    };
    let owner = || vec![AccessRule::Owner("id")];
    let dynamic = || vec![AccessRule::Dynamic];

    // Public auth routes, the abusable ones behind per-IP limits
    let public_routes = Router::new()
        .merge(rate_limited(
            &state.login_rate_limiter,
            "/api/v1/auth/login",
            post(handlers::auth::login),
        ))
        .merge(rate_limited(
            &state.register_rate_limiter,
            "/api/v1/auth/register",
            post(handlers::auth::register),
        ))
        .merge(rate_limited(
            &state.password_reset_rate_limiter,
            "/api/v1/auth/reset-password",
            post(handlers::auth::request_password_reset),
        ))
        .merge(rate_limited(
            &state.verification_rate_limiter,
            "/api/v1/auth/resend-verification",
            post(handlers::auth::resend_verification),
        ))
        .route("/api/v1/auth/refresh", post(handlers::auth::refresh))
        .route(
            "/api/v1/auth/confirm-reset",
            post(handlers::auth::confirm_password_reset),
        )
        .route("/api/v1/auth/verify-email", get(handlers::auth::verify_email));

    let protected_routes = Router::new()
        .route("/api/v1/auth/logout", post(handlers::auth::logout))
        .route("/api/v1/auth/logout-all", post(handlers::auth::logout_all))
        .route("/api/v1/auth/me", get(handlers::auth::me))
        // Users
        .route(
            "/api/v1/users",
            get(handlers::user::list_users).layer(guard(permission("users", "read"))),
        )
        .route(
            "/api/v1/users",
            post(handlers::user::create_user).layer(guard(permission("users", "create"))),
        )
        .route(
            "/api/v1/users/:id",
            get(handlers::user::get_user)
                .put(handlers::user::update_user)
                .patch(handlers::user::update_user)
                .layer(guard(owner())),
        )
        .route(
            "/api/v1/users/:id",
            delete(handlers::user::delete_user).layer(guard(permission("users", "delete"))),
        )
        .route(
            "/api/v1/users/:id/password",
            put(handlers::user::change_password),
        )
        .route(
            "/api/v1/users/:id/activate",
            post(handlers::user::activate_user).layer(guard(permission("users", "update"))),
        )
        .route(
            "/api/v1/users/:id/deactivate",
            post(handlers::user::deactivate_user).layer(guard(permission("users", "update"))),
        )
        .route(
            "/api/v1/users/:id/permissions",
            get(handlers::user::user_permissions).layer(guard(owner())),
        )
        .route(
            "/api/v1/users/:id/roles",
            get(handlers::user::user_roles).layer(guard(owner())),
        )
        .route(
            "/api/v1/users/:id/roles",
            post(handlers::user::assign_role).layer(guard(permission("roles", "assign"))),
        )
        .route(
            "/api/v1/users/:id/roles/:role_id",
            delete(handlers::user::unassign_role).layer(guard(permission("roles", "assign"))),
        )
        // Roles
        .route(
            "/api/v1/roles",
            get(handlers::role::list_roles)
                .post(handlers::role::create_role)
                .layer(guard(dynamic())),
        )
        .route(
            "/api/v1/roles/:id",
            get(handlers::role::get_role)
                .put(handlers::role::update_role)
                .patch(handlers::role::update_role)
                .delete(handlers::role::delete_role)
                .layer(guard(dynamic())),
        )
        .route(
            "/api/v1/roles/:id/permissions",
            post(handlers::role::grant_permissions).layer(guard(dynamic())),
        )
        .route(
            "/api/v1/roles/:id/permissions/:permission_id",
            delete(handlers::role::revoke_permission).layer(guard(dynamic())),
        )
        // Permissions
        .route(
            "/api/v1/permissions",
            get(handlers::permission::list_permissions)
                .post(handlers::permission::create_permission)
                .layer(guard(dynamic())),
        )
        .route(
            "/api/v1/permissions/:id",
            get(handlers::permission::get_permission)
                .put(handlers::permission::update_permission)
                .patch(handlers::permission::update_permission)
                .delete(handlers::permission::delete_permission)
                .layer(guard(dynamic())),
        )
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let idempotency = IdempotencyGate::new(state.inbox.clone(), &state.config.idempotency);
    let api_routes = public_routes
        .merge(protected_routes)
        .route_layer(from_fn_with_state(idempotency, idempotency_middleware));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(api_routes);

    if state.config.is_prod() {
        app = app.route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    } else {
        app = app.merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()));
    }

    let cors = cors_layer(&state.config.security.allowed_origins)?;

    let app = app
        .route_layer(from_fn(metrics_middleware))
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors);

    Ok(app)
}

fn rate_limited(
    limiter: &IpRateLimiter,
    path: &str,
    route: MethodRouter<AppState>,
) -> Router<AppState> {
    Router::new()
        .route(path, route)
        .layer(from_fn_with_state(limiter.clone(), ip_rate_limit_middleware))
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, AppError> {
    let origins = allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", o, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-request-id"),
        ]))
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A dependency is down")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.store.health_check().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::error!(error = %e, "Store health check failed");
            "down"
        }
    };
    let cache = match state.cache.health_check().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::error!(error = %e, "Cache health check failed");
            "down"
        }
    };

    let healthy = store == "up" && cache == "up";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "environment": format!("{:?}", state.config.environment),
            "checks": {
                "store": store,
                "cache": cache,
            }
        })),
    )
}
