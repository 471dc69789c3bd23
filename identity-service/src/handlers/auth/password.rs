use service_core::{
    axum::{
        extract::{Query, State},
        response::IntoResponse,
    },
    error::AppError,
    response::MessageData,
};
use validator::Validate;

use crate::{
    dtos::{
        auth::{PasswordResetConfirm, PasswordResetRequest, TokenQuery},
        ErrorResponse, MessageResponse,
    },
    utils::ValidatedJson,
    AppState,
};

/// Start a password reset. Always answers 200 so the response cannot be
/// used to probe for registered addresses.
#[utoipa::path(
    post,
    path = "/api/v1/auth/reset-password",
    request_body = PasswordResetRequest,
    responses(
        (status = 200, description = "Request accepted", body = MessageResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(e) = state.auth.request_password_reset(&req.email).await {
        tracing::error!(error = %e, "Password reset request failed");
    }
    Ok(MessageData::response(
        "If the email exists, a password reset link has been sent",
    ))
}

/// Complete a password reset with the emailed token
#[utoipa::path(
    post,
    path = "/api/v1/auth/confirm-reset",
    params(TokenQuery),
    request_body = PasswordResetConfirm,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid token or weak password", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> Result<impl IntoResponse, AppError> {
    query.validate()?;
    state
        .auth
        .confirm_password_reset(&query.token, &req.new_password)
        .await?;
    Ok(MessageData::response("Password has been reset"))
}
