use service_core::error::AppError;
use thiserror::Error;

use super::policy::PolicyError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    /// Uniform login failure; never says which part was wrong.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error("Invalid token")]
    InvalidToken,

    #[error("invalid or expired reset token")]
    InvalidResetToken,

    #[error("invalid or expired verification token")]
    InvalidVerificationToken,

    #[error("User not found")]
    UserNotFound,

    #[error("Role not found")]
    RoleNotFound,

    #[error("Permission not found")]
    PermissionNotFound,

    #[error("Assignment not found")]
    AssignmentNotFound,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    WeakPassword(#[from] PolicyError),

    #[error("Email error: {0}")]
    Email(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Redis(e) => AppError::RedisError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::InvalidCredentials => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid email or password"))
            }
            ServiceError::InvalidToken => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
            }
            ServiceError::EmailAlreadyRegistered => {
                AppError::Conflict(anyhow::anyhow!("Email already registered"))
            }
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            e @ (ServiceError::InvalidResetToken
            | ServiceError::InvalidVerificationToken
            | ServiceError::Validation(_)
            | ServiceError::WeakPassword(_)) => AppError::BadRequest(anyhow::anyhow!(e.to_string())),
            e @ (ServiceError::UserNotFound
            | ServiceError::RoleNotFound
            | ServiceError::PermissionNotFound
            | ServiceError::AssignmentNotFound) => AppError::NotFound(anyhow::anyhow!(e.to_string())),
            ServiceError::PermissionDenied => {
                AppError::Forbidden(anyhow::anyhow!("Insufficient permissions"))
            }
            ServiceError::Email(e) => AppError::EmailError(e),
        }
    }
}

/// Maps a Postgres unique violation to `Conflict`, everything else to `Database`.
pub fn map_unique_violation(err: sqlx::Error, conflict_message: &str) -> ServiceError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return ServiceError::Conflict(conflict_message.to_string());
        }
    }
    ServiceError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (ServiceError::InvalidToken, StatusCode::UNAUTHORIZED),
            (ServiceError::EmailAlreadyRegistered, StatusCode::CONFLICT),
            (ServiceError::InvalidResetToken, StatusCode::BAD_REQUEST),
            (ServiceError::UserNotFound, StatusCode::NOT_FOUND),
            (ServiceError::PermissionDenied, StatusCode::FORBIDDEN),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn test_reset_token_message_is_kept() {
        let app: AppError = ServiceError::InvalidResetToken.into();
        assert_eq!(
            app.to_string(),
            "Bad request: invalid or expired reset token"
        );
    }
}
