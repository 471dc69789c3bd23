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
        role::{CreatePermissionRequest, PermissionListResponse, UpdatePermissionRequest},
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    models::{ListParams, PermissionResponse},
    utils::ValidatedJson,
    AppState,
};

/// List permissions, optionally filtered by resource or action
#[utoipa::path(
    get,
    path = "/api/v1/permissions",
    params(ListParams),
    responses(
        (status = 200, description = "Page of permissions", body = PermissionListResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    tag = "Permissions",
    security(("bearer_auth" = []))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.roles.list_permissions(&params).await?;
    Ok(ApiResponse::ok(PermissionListResponse::from(
        page.map(PermissionResponse::from),
    )))
}

/// Create a permission
#[utoipa::path(
    post,
    path = "/api/v1/permissions",
    request_body = CreatePermissionRequest,
    responses(
        (status = 201, description = "Permission created", body = PermissionResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Permission exists", body = ErrorResponse)
    ),
    tag = "Permissions",
    security(("bearer_auth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<CreatePermissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let permission = state.roles.create_permission(req, Some(ctx.user.id)).await?;
    Ok(ApiResponse::created(PermissionResponse::from(permission)))
}

#[utoipa::path(
    get,
    path = "/api/v1/permissions/{id}",
    params(("id" = Uuid, Path, description = "Permission ID")),
    responses(
        (status = 200, description = "Permission", body = PermissionResponse),
        (status = 404, description = "Permission not found", body = ErrorResponse)
    ),
    tag = "Permissions",
    security(("bearer_auth" = []))
)]
pub async fn get_permission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let permission = state.roles.get_permission(id).await?;
    Ok(ApiResponse::ok(PermissionResponse::from(permission)))
}

#[utoipa::path(
    put,
    path = "/api/v1/permissions/{id}",
    params(("id" = Uuid, Path, description = "Permission ID")),
    request_body = UpdatePermissionRequest,
    responses(
        (status = 200, description = "Permission updated", body = PermissionResponse),
        (status = 404, description = "Permission not found", body = ErrorResponse)
    ),
    tag = "Permissions",
    security(("bearer_auth" = []))
)]
pub async fn update_permission(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdatePermissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let permission = state
        .roles
        .update_permission(id, req, Some(ctx.user.id))
        .await?;
    Ok(ApiResponse::ok(PermissionResponse::from(permission)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/permissions/{id}",
    params(("id" = Uuid, Path, description = "Permission ID")),
    responses(
        (status = 200, description = "Permission deleted", body = MessageResponse),
        (status = 404, description = "Permission not found", body = ErrorResponse)
    ),
    tag = "Permissions",
    security(("bearer_auth" = []))
)]
pub async fn delete_permission(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.roles.delete_permission(id).await?;
    Ok(MessageData::response("Permission deleted"))
}
