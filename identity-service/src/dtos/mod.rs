pub mod auth;
pub mod role;
pub mod user;

use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Error envelope as rendered by `AppError`. Documentation only.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = false)]
    pub success: bool,
    pub error: ErrorDetail,
    #[schema(value_type = String, format = "date-time")]
    pub timestamp: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorDetail {
    #[schema(example = "VALIDATION_ERROR")]
    pub code: String,
    pub message: String,
    pub fields: Option<BTreeMap<String, Vec<String>>>,
    pub correlation_id: Option<String>,
}

/// Plain acknowledgement body.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "Logged out successfully")]
    pub message: String,
}
