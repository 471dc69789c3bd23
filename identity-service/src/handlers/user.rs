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
        auth::ChangePasswordRequest,
        user::{
            AssignRoleRequest, CreateUserRequest, DeleteUserQuery, UpdateUserRequest,
            UserListResponse, UserRolesResponse,
        },
        ErrorResponse, MessageResponse,
    },
    middleware::AuthUser,
    models::{ListParams, UserResponse, UserRoleAssignment},
    services::EffectivePermission,
    utils::ValidatedJson,
    AppState,
};

/// List users
#[utoipa::path(
    get,
    path = "/api/v1/users",
    params(ListParams),
    responses(
        (status = 200, description = "Page of users", body = UserListResponse),
        (status = 400, description = "Bad listing parameters", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn list_users(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let page = state.users.list(&params).await?;
    Ok(ApiResponse::ok(UserListResponse::from(
        page.map(UserResponse::from),
    )))
}

/// Create a user
#[utoipa::path(
    post,
    path = "/api/v1/users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn create_user(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    ValidatedJson(req): ValidatedJson<CreateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.users.create(req, Some(ctx.user.id)).await?;
    Ok(ApiResponse::created(user.sanitized()))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = UserResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.users.get(id).await?;
    Ok(ApiResponse::ok(user.sanitized()))
}

/// Update a user's profile fields
#[utoipa::path(
    put,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.users.update(id, req).await?;
    Ok(ApiResponse::ok(user.sanitized()))
}

/// Delete a user (soft by default, `?hard=true` removes the row)
#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}",
    params(("id" = Uuid, Path, description = "User ID"), DeleteUserQuery),
    responses(
        (status = 200, description = "User deleted", body = MessageResponse),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteUserQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.hard {
        state.users.hard_delete(id).await?;
    } else {
        state.users.soft_delete(id).await?;
    }
    Ok(MessageData::response("User deleted"))
}

/// Change the caller's own password
#[utoipa::path(
    put,
    path = "/api/v1/users/{id}/password",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Wrong current password or weak new password", body = ErrorResponse),
        (status = 403, description = "Not the account owner", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    if ctx.user.id != id {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Passwords can only be changed by their owner"
        )));
    }

    state
        .auth
        .change_password(id, &req.current_password, &req.new_password)
        .await?;
    Ok(MessageData::response("Password changed"))
}

/// Activate a user
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/activate",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User activated", body = UserResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn activate_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.users.activate(id).await?;
    Ok(ApiResponse::ok(user.sanitized()))
}

/// Deactivate a user
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/deactivate",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User deactivated", body = UserResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn deactivate_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.users.deactivate(id).await?;
    Ok(ApiResponse::ok(user.sanitized()))
}

/// Effective role names of a user
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/roles",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Effective roles", body = UserRolesResponse),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn user_roles(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.users.get(id).await?;
    let roles = state.rbac.roles_of(id).await?;
    Ok(ApiResponse::ok(UserRolesResponse { user_id: id, roles }))
}

/// Effective permissions of a user
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}/permissions",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Effective permissions", body = [EffectivePermission]),
        (status = 404, description = "User not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn user_permissions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.users.get(id).await?;
    let permissions = state.rbac.effective_permissions(id).await?;
    Ok(ApiResponse::ok(permissions))
}

/// Assign a role to a user
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/roles",
    params(("id" = Uuid, Path, description = "User ID")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = UserRoleAssignment),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 404, description = "User or role not found", body = ErrorResponse),
        (status = 409, description = "Role already assigned", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn assign_role(
    State(state): State<AppState>,
    AuthUser(ctx): AuthUser,
    Path(id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<AssignRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let assignment = state.users.assign_role(id, req, Some(ctx.user.id)).await?;
    Ok(ApiResponse::created(assignment))
}

/// Remove a role from a user
#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}/roles/{role_id}",
    params(
        ("id" = Uuid, Path, description = "User ID"),
        ("role_id" = Uuid, Path, description = "Role ID")
    ),
    responses(
        (status = 200, description = "Role unassigned", body = MessageResponse),
        (status = 404, description = "Assignment not found", body = ErrorResponse)
    ),
    tag = "Users",
    security(("bearer_auth" = []))
)]
pub async fn unassign_role(
    State(state): State<AppState>,
    Path((id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    state.users.unassign_role(id, role_id).await?;
    Ok(MessageData::response("Role unassigned"))
}
