use service_core::{
    axum::{
        extract::{Query, State},
        response::IntoResponse,
    },
    error::AppError,
    response::{ApiResponse, MessageData},
};
use validator::Validate;

use crate::{
    dtos::{
        auth::{AuthResponse, RegisterRequest, ResendVerificationRequest, TokenQuery},
        ErrorResponse, MessageResponse,
    },
    models::UserResponse,
    utils::ValidatedJson,
    AppState,
};

/// Register a new user and issue a token pair
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = AuthResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let res = state.auth.register(req).await?;
    Ok(ApiResponse::created(res))
}

/// Verify an email address with the emailed token
#[utoipa::path(
    get,
    path = "/api/v1/auth/verify-email",
    params(TokenQuery),
    responses(
        (status = 200, description = "Email verified", body = UserResponse),
        (status = 400, description = "Invalid or used token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, AppError> {
    query.validate()?;
    let user = state.auth.verify_email(&query.token).await?;
    Ok(ApiResponse::ok(user))
}

/// Send a fresh verification email. The response does not reveal whether
/// the address is registered.
#[utoipa::path(
    post,
    path = "/api/v1/auth/resend-verification",
    request_body = ResendVerificationRequest,
    responses(
        (status = 200, description = "Request accepted", body = MessageResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn resend_verification(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ResendVerificationRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.resend_verification(&req.email).await?;
    Ok(MessageData::response(
        "If the account exists and is unverified, a verification email has been sent",
    ))
}
