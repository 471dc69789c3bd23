use service_core::axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;

use crate::{
    models::User,
    services::{Claims, ServiceError},
    AppState,
};

/// Caller identity placed in request extensions by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub claims: Claims,
    /// The raw bearer token, kept so logout can denylist it.
    pub token: String,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Requires a valid, non-revoked access token of an active user.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?
        .to_string();

    let (user, claims) = match state.auth.validate_token(&token).await {
        Ok(found) => found,
        Err(ServiceError::InvalidToken) => {
            tracing::debug!("Rejected bearer token");
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "Invalid or expired token"
            )));
        }
        Err(e) => {
            tracing::error!(error = %e, "Token validation failed");
            return Err(e.into());
        }
    };

    req.extensions_mut().insert(AuthContext {
        user,
        claims,
        token,
    });

    Ok(next.run(req).await)
}

/// Extractor for handlers behind [`auth_middleware`].
pub struct AuthUser(pub AuthContext);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}
