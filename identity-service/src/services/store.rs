//! Identity Store contract.
//!
//! Every mutation takes the outbox events it produces and persists them in
//! the same transaction as the entity change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ServiceError;
use crate::models::{
    ListParams, NewOutboxMessage, NewUser, Page, Permission, Role, RolePermissionGrant, User,
    UserRoleAssignment,
};

pub const USER_SORT_KEYS: &[&str] = &["email", "name", "created_at", "updated_at"];
pub const ROLE_SORT_KEYS: &[&str] = &["name", "display_name", "created_at", "updated_at"];
pub const PERMISSION_SORT_KEYS: &[&str] = &["name", "resource", "action", "created_at", "updated_at"];

#[derive(Debug, Clone)]
pub struct NewRole {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewPermission {
    pub id: Uuid,
    pub resource: String,
    pub action: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
}

impl NewPermission {
    pub fn name(&self) -> String {
        Permission::canonical_name(&self.resource, &self.action)
    }
}

#[derive(Debug, Clone)]
pub struct NewAssignment {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub assigned_by: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // Users

    /// Fails with `Conflict` when the email is taken (case-insensitive).
    async fn create_user(
        &self,
        user: NewUser,
        events: &[NewOutboxMessage],
    ) -> Result<User, ServiceError>;

    /// Includes soft-deleted users; callers check the state.
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, ServiceError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;

    /// Persists every mutable column of `user` and stamps `updated_at`.
    async fn update_user(
        &self,
        user: &User,
        events: &[NewOutboxMessage],
    ) -> Result<User, ServiceError>;

    /// Removes the row and its assignments. `false` when nothing was deleted.
    async fn hard_delete_user(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError>;

    /// Soft-deleted users are excluded.
    async fn list_users(&self, params: &ListParams) -> Result<Page<User>, ServiceError>;

    // Roles

    async fn create_role(
        &self,
        role: NewRole,
        events: &[NewOutboxMessage],
    ) -> Result<Role, ServiceError>;

    async fn find_role_by_id(&self, id: Uuid) -> Result<Option<Role>, ServiceError>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, ServiceError>;

    async fn update_role(
        &self,
        role: &Role,
        events: &[NewOutboxMessage],
    ) -> Result<Role, ServiceError>;

    /// Cascades to the role's grants and assignments.
    async fn delete_role(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError>;

    async fn list_roles(&self, params: &ListParams) -> Result<Page<Role>, ServiceError>;

    // Permissions

    /// Fails with `Conflict` when `(resource, action)` exists.
    async fn create_permission(
        &self,
        permission: NewPermission,
        events: &[NewOutboxMessage],
    ) -> Result<Permission, ServiceError>;

    async fn find_permission_by_id(&self, id: Uuid) -> Result<Option<Permission>, ServiceError>;

    async fn find_permission(
        &self,
        resource: &str,
        action: &str,
    ) -> Result<Option<Permission>, ServiceError>;

    async fn update_permission(
        &self,
        permission: &Permission,
        events: &[NewOutboxMessage],
    ) -> Result<Permission, ServiceError>;

    async fn delete_permission(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError>;

    async fn list_permissions(&self, params: &ListParams)
        -> Result<Page<Permission>, ServiceError>;

    // Grants

    /// Creates the grant or reactivates an existing one.
    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_by: Option<Uuid>,
        events: &[NewOutboxMessage],
    ) -> Result<RolePermissionGrant, ServiceError>;

    /// Deactivates the grant. `false` when no active grant existed.
    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError>;

    // Assignments

    /// Creates the assignment, or reactivates the existing `(user, role)`
    /// row and bumps its `version`.
    async fn assign_role(
        &self,
        assignment: NewAssignment,
        events: &[NewOutboxMessage],
    ) -> Result<UserRoleAssignment, ServiceError>;

    /// Deactivates the assignment. `false` when no active assignment existed.
    async fn unassign_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError>;

    async fn assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserRoleAssignment>, ServiceError>;

    // Evaluator reads

    /// Active roles reached through effective assignments, ordered by name.
    async fn effective_roles_for(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Role>, ServiceError>;

    /// Active permissions reached through active grants, ordered by name.
    async fn active_permissions_for_role(
        &self,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, ServiceError>;

    async fn role_has(
        &self,
        resource: &str,
        action: &str,
        role_id: Uuid,
    ) -> Result<bool, ServiceError>;

    async fn role_has_by_name(
        &self,
        role_id: Uuid,
        permission_name: &str,
    ) -> Result<bool, ServiceError>;

    /// Flips `is_active` off on assignments expired at `now`.
    async fn cleanup_expired_assignments(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;
}
