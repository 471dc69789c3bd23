use service_core::{
    axum::{
        extract::{Path, Query, State},
        response::IntoResponse,
    },
    error::AppError,
    response::{ApiResponse, MessageData},
};
use uuid::Uuid;

use crate::{
    dtos::{
        role::{
            CreateRoleRequest, GrantPermissionsRequest, GrantResponse, RoleDetailResponse,
            RoleListResponse, UpdateRoleRequest,
        },
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    models::{ListParams, PermissionResponse, RoleResponse},
    utils::ValidatedJson,
    AppState,
};

/// List roles
#[utoipa::path(
    get,
    path = "/api/v1/roles",
    params(ListParams),
    responses(
        (status = 200, description = "Page of roles", body = RoleListResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.roles.list_roles(&params).await?;
    Ok(ApiResponse::ok(RoleListResponse::from(
        page.map(RoleResponse::from),
    )))
}

/// Create a role
#[utoipa::path(
    post,
    path = "/api/v1/roles",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = RoleResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Role name taken", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state.roles.create_role(req, Some(ctx.user.id)).await?;
    Ok(ApiResponse::created(RoleResponse::from(role)))
}

/// Get a role with its permissions
#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}",
    params(("id" = Uuid, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Role", body = RoleDetailResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn get_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let (role, permissions) = state.roles.role_detail(id).await?;
    Ok(ApiResponse::ok(RoleDetailResponse {
        role: role.into(),
        permissions: permissions.into_iter().map(PermissionResponse::from).collect(),
    }))
}

/// Update a role
#[utoipa::path(
    put,
    path = "/api/v1/roles/{id}",
    params(("id" = Uuid, Path, description = "Role ID")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated", body = RoleResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let role = state.roles.update_role(id, req, Some(ctx.user.id)).await?;
    Ok(ApiResponse::ok(RoleResponse::from(role)))
}

/// Delete a role; its assignments and grants go with it
#[utoipa::path(
    delete,
    path = "/api/v1/roles/{id}",
    params(("id" = Uuid, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Role deleted", body = MessageResponse),
        (status = 404, description = "Role not found", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.roles.delete_role(id).await?;
    Ok(MessageData::response("Role deleted"))
}

/// Grant permissions to a role
#[utoipa::path(
    post,
    path = "/api/v1/roles/{id}/permissions",
    params(("id" = Uuid, Path, description = "Role ID")),
    request_body = GrantPermissionsRequest,
    responses(
        (status = 200, description = "Permissions granted", body = GrantResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "Role or permission not found", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn grant_permissions(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<GrantPermissionsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let granted = state
        .roles
        .grant_permissions(id, &req.permission_ids, Some(ctx.user.id))
        .await?;
    Ok(ApiResponse::ok(GrantResponse {
        role_id: id,
        granted,
    }))
}

/// Revoke a permission from a role
#[utoipa::path(
    delete,
    path = "/api/v1/roles/{id}/permissions/{permission_id}",
    params(
        ("id" = Uuid, Path, description = "Role ID"),
        ("permission_id" = Uuid, Path, description = "Permission ID")
    ),
    responses(
        (status = 200, description = "Permission revoked", body = MessageResponse),
        (status = 404, description = "Grant not found", body = ErrorResponse)
    ),
    tag = "Roles",
    security(("bearer_auth" = []))
)]
pub async fn revoke_permission(
    State(state): State<AppState>,
    Path((id, permission_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    state.roles.revoke_permission(id, permission_id).await?;
    Ok(MessageData::response("Permission revoked"))
}
