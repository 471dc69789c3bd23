use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Page, PermissionResponse, RoleResponse};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    /// Machine name: lowercase letter followed by lowercase letters, digits or `_`.
    #[validate(length(min = 1, max = 64, message = "Role name must be 1-64 characters"))]
    #[schema(example = "billing_admin")]
    pub name: String,

    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    #[schema(example = "Billing Admin")]
    pub display_name: String,

    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdateRoleRequest {
    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    pub display_name: Option<String>,

    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct GrantPermissionsRequest {
    #[validate(length(min = 1, message = "At least one permission is required"))]
    pub permission_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreatePermissionRequest {
    #[validate(length(min = 1, max = 64, message = "Resource must be 1-64 characters"))]
    #[schema(example = "users")]
    pub resource: String,

    #[validate(length(min = 1, max = 64, message = "Action must be 1-64 characters"))]
    #[schema(example = "read")]
    pub action: String,

    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct UpdatePermissionRequest {
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleDetailResponse {
    pub role: RoleResponse,
    pub permissions: Vec<PermissionResponse>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleListResponse {
    pub items: Vec<RoleResponse>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

impl From<Page<RoleResponse>> for RoleListResponse {
    fn from(page: Page<RoleResponse>) -> Self {
        Self {
            items: page.items,
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PermissionListResponse {
    pub items: Vec<PermissionResponse>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

impl From<Page<PermissionResponse>> for PermissionListResponse {
    fn from(page: Page<PermissionResponse>) -> Self {
        Self {
            items: page.items,
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GrantResponse {
    pub role_id: Uuid,
    pub granted: Vec<Uuid>,
}
