use service_core::{
    axum::{extract::State, response::IntoResponse, Json},
    error::AppError,
    response::{ApiResponse, MessageData},
};

use crate::{
    dtos::{
        auth::{AuthResponse, LoginRequest, LogoutRequest, RefreshRequest},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    models::UserResponse,
    services::TokenResponse,
    utils::ValidatedJson,
    AppState,
};

/// Login with email and password
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state.auth.login(req).await?;
    Ok(ApiResponse::ok(res))
}

/// Exchange a refresh token for a new access token
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token refreshed", body = TokenResponse),
        (status = 401, description = "Invalid refresh token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tokens = state.auth.refresh(&req.refresh_token).await?;
    Ok(ApiResponse::ok(tokens))
}

/// Logout: denylists the presented access token and, optionally, the
/// matching refresh token
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    request_body(content = LogoutRequest, description = "Optional refresh token"),
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    body: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    state
        .auth
        .logout(&ctx.token, req.refresh_token.as_deref())
        .await?;
    Ok(MessageData::response("Logged out successfully"))
}

/// Revoke every session of the caller
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout-all",
    responses(
        (status = 200, description = "All sessions revoked", body = MessageResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn logout_all(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    state.auth.logout_all(ctx.user.id, &ctx.token).await?;
    Ok(MessageData::response("All sessions revoked"))
}

/// Current user
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Current user", body = UserResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn me(AuthUser(ctx): AuthUser) -> Result<impl IntoResponse, AppError> {
    Ok(ApiResponse::ok(ctx.user.sanitized()))
}
