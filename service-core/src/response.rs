//! JSON envelope shared by every HTTP response.
//!
//! Success: `{ "success": true, "data": ..., "timestamp": ... }`
//! Failure: `{ "success": false, "error": { "code", "message", ... }, "timestamp": ... }`

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
            timestamp: Utc::now(),
        }
    }

    /// 200 with the data wrapped in the envelope.
    pub fn ok(data: T) -> Response {
        (StatusCode::OK, Json(Self::new(data))).into_response()
    }

    /// 201 with the data wrapped in the envelope.
    pub fn created(data: T) -> Response {
        (StatusCode::CREATED, Json(Self::new(data))).into_response()
    }
}

/// Body used for plain acknowledgement responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageData {
    pub message: String,
}

impl MessageData {
    pub fn response(message: impl Into<String>) -> Response {
        ApiResponse::ok(MessageData {
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEnvelope {
    pub fn new(error: ErrorBody) -> Self {
        Self {
            success: false,
            error,
            timestamp: Utc::now(),
        }
    }
}
