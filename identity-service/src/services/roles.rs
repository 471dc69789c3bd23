//! Role and permission administration.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    dtos::role::{
        CreatePermissionRequest, CreateRoleRequest, UpdatePermissionRequest, UpdateRoleRequest,
    },
    models::{ListParams, NewOutboxMessage, Page, Permission, Role},
    services::{
        store::{IdentityStore, NewPermission, NewRole},
        ServiceError,
    },
};

/// `^[a-z][a-z0-9_]*$`
fn is_machine_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn check_machine_name(field: &str, value: &str) -> Result<(), ServiceError> {
    if is_machine_name(value) {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "{} must start with a lowercase letter and contain only lowercase letters, digits or '_'",
            field
        )))
    }
}

#[derive(Clone)]
pub struct RoleService {
    store: Arc<dyn IdentityStore>,
    outbox_max_retries: i32,
}

impl RoleService {
    pub fn new(store: Arc<dyn IdentityStore>, outbox_max_retries: i32) -> Self {
        Self {
            store,
            outbox_max_retries,
        }
    }

    fn event(
        &self,
        event_type: &str,
        aggregate_id: Uuid,
        data: serde_json::Value,
    ) -> Result<NewOutboxMessage, ServiceError> {
        NewOutboxMessage::json(event_type, aggregate_id, &data, self.outbox_max_retries)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode event: {}", e)))
    }

    // Roles

    pub async fn create_role(
        &self,
        req: CreateRoleRequest,
        actor: Option<Uuid>,
    ) -> Result<Role, ServiceError> {
        let name = req.name.trim().to_string();
        check_machine_name("name", &name)?;

        if self.store.find_role_by_name(&name).await?.is_some() {
            return Err(ServiceError::Conflict(format!("Role '{}' already exists", name)));
        }

        let id = Uuid::new_v4();
        let event = self.event(
            "role.created",
            id,
            json!({ "role_id": id, "name": name, "created_by": actor }),
        )?;
        let role = self
            .store
            .create_role(
                NewRole {
                    id,
                    name,
                    display_name: req.display_name,
                    description: req.description,
                    is_active: req.is_active.unwrap_or(true),
                    created_by: actor,
                },
                &[event],
            )
            .await?;

        tracing::info!(role_id = %role.id, name = %role.name, "Role created");
        Ok(role)
    }

    pub async fn get_role(&self, id: Uuid) -> Result<Role, ServiceError> {
        self.store
            .find_role_by_id(id)
            .await?
            .ok_or(ServiceError::RoleNotFound)
    }

    /// The role with its active permissions.
    pub async fn role_detail(&self, id: Uuid) -> Result<(Role, Vec<Permission>), ServiceError> {
        let role = self.get_role(id).await?;
        let permissions = self.store.active_permissions_for_role(id).await?;
        Ok((role, permissions))
    }

    pub async fn list_roles(&self, params: &ListParams) -> Result<Page<Role>, ServiceError> {
        self.store.list_roles(params).await
    }

    pub async fn update_role(
        &self,
        id: Uuid,
        req: UpdateRoleRequest,
        actor: Option<Uuid>,
    ) -> Result<Role, ServiceError> {
        let mut role = self.get_role(id).await?;
        if let Some(display_name) = req.display_name {
            role.display_name = display_name;
        }
        if let Some(description) = req.description {
            role.description = Some(description);
        }
        if let Some(is_active) = req.is_active {
            role.is_active = is_active;
        }
        role.updated_by = actor;

        let event = self.event(
            "role.updated",
            id,
            json!({ "role_id": id, "is_active": role.is_active, "updated_by": actor }),
        )?;
        let role = self.store.update_role(&role, &[event]).await?;

        tracing::info!(role_id = %id, "Role updated");
        Ok(role)
    }

    /// Drops the role together with its grants and assignments.
    pub async fn delete_role(&self, id: Uuid) -> Result<(), ServiceError> {
        let event = self.event("role.deleted", id, json!({ "role_id": id }))?;
        if !self.store.delete_role(id, &[event]).await? {
            return Err(ServiceError::RoleNotFound);
        }

        tracing::info!(role_id = %id, "Role deleted");
        Ok(())
    }

    // Permissions

    pub async fn create_permission(
        &self,
        req: CreatePermissionRequest,
        actor: Option<Uuid>,
    ) -> Result<Permission, ServiceError> {
        let resource = req.resource.trim().to_lowercase();
        let action = req.action.trim().to_lowercase();
        check_machine_name("resource", &resource)?;
        check_machine_name("action", &action)?;

        if self.store.find_permission(&resource, &action).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Permission '{}' already exists",
                Permission::canonical_name(&resource, &action)
            )));
        }

        let id = Uuid::new_v4();
        let event = self.event(
            "permission.created",
            id,
            json!({
                "permission_id": id,
                "name": Permission::canonical_name(&resource, &action),
                "created_by": actor,
            }),
        )?;
        let permission = self
            .store
            .create_permission(
                NewPermission {
                    id,
                    resource,
                    action,
                    description: req.description,
                    is_active: req.is_active.unwrap_or(true),
                    created_by: actor,
                },
                &[event],
            )
            .await?;

        tracing::info!(permission_id = %permission.id, name = %permission.name, "Permission created");
        Ok(permission)
    }

    pub async fn get_permission(&self, id: Uuid) -> Result<Permission, ServiceError> {
        self.store
            .find_permission_by_id(id)
            .await?
            .ok_or(ServiceError::PermissionNotFound)
    }

    pub async fn list_permissions(
        &self,
        params: &ListParams,
    ) -> Result<Page<Permission>, ServiceError> {
        self.store.list_permissions(params).await
    }

    pub async fn update_permission(
        &self,
        id: Uuid,
        req: UpdatePermissionRequest,
        actor: Option<Uuid>,
    ) -> Result<Permission, ServiceError> {
        let mut permission = self.get_permission(id).await?;
        if let Some(description) = req.description {
            permission.description = Some(description);
        }
        if let Some(is_active) = req.is_active {
            permission.is_active = is_active;
        }
        permission.updated_by = actor;

        let event = self.event(
            "permission.updated",
            id,
            json!({ "permission_id": id, "is_active": permission.is_active }),
        )?;
        let permission = self.store.update_permission(&permission, &[event]).await?;

        tracing::info!(permission_id = %id, "Permission updated");
        Ok(permission)
    }

    pub async fn delete_permission(&self, id: Uuid) -> Result<(), ServiceError> {
        let event = self.event("permission.deleted", id, json!({ "permission_id": id }))?;
        if !self.store.delete_permission(id, &[event]).await? {
            return Err(ServiceError::PermissionNotFound);
        }

        tracing::info!(permission_id = %id, "Permission deleted");
        Ok(())
    }

    // Grants

    /// Grants each permission in turn; one transaction per grant. Stops at
    /// the first unknown id.
    pub async fn grant_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
        actor: Option<Uuid>,
    ) -> Result<Vec<Uuid>, ServiceError> {
        self.get_role(role_id).await?;

        let mut granted = Vec::with_capacity(permission_ids.len());
        for &permission_id in permission_ids {
            let event = self.event(
                "role.permission_granted",
                role_id,
                json!({ "role_id": role_id, "permission_id": permission_id, "granted_by": actor }),
            )?;
            let grant = self
                .store
                .grant_permission(role_id, permission_id, actor, &[event])
                .await?;
            granted.push(grant.permission_id);
        }

        tracing::info!(role_id = %role_id, count = granted.len(), "Permissions granted");
        Ok(granted)
    }

    pub async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
    ) -> Result<(), ServiceError> {
        let event = self.event(
            "role.permission_revoked",
            role_id,
            json!({ "role_id": role_id, "permission_id": permission_id }),
        )?;
        if !self
            .store
            .revoke_permission(role_id, permission_id, &[event])
            .await?
        {
            return Err(ServiceError::PermissionNotFound);
        }

        tracing::info!(role_id = %role_id, permission_id = %permission_id, "Permission revoked");
        Ok(())
    }

    /// Returns the named role, creating it active when missing.
    pub async fn ensure_role(&self, name: &str, display_name: &str) -> Result<Role, ServiceError> {
        if let Some(role) = self.store.find_role_by_name(name).await? {
            return Ok(role);
        }

        match self
            .create_role(
                CreateRoleRequest {
                    name: name.to_string(),
                    display_name: display_name.to_string(),
                    description: Some("Seeded at startup".to_string()),
                    is_active: Some(true),
                },
                None,
            )
            .await
        {
            Ok(role) => Ok(role),
            // another instance seeded it first
            Err(ServiceError::Conflict(_)) => self
                .store
                .find_role_by_name(name)
                .await?
                .ok_or(ServiceError::RoleNotFound),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::MemoryStore;
    use crate::services::outbox::OutboxStore;

    fn service() -> (RoleService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RoleService::new(store.clone(), 3), store)
    }

    fn role_req(name: &str) -> CreateRoleRequest {
        CreateRoleRequest {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            description: None,
            is_active: None,
        }
    }

    fn perm_req(resource: &str, action: &str) -> CreatePermissionRequest {
        CreatePermissionRequest {
            resource: resource.to_string(),
            action: action.to_string(),
            description: None,
            is_active: None,
        }
    }

    #[test]
    fn test_machine_names() {
        assert!(is_machine_name("billing_admin2"));
        assert!(!is_machine_name("Admin"));
        assert!(!is_machine_name("2fast"));
        assert!(!is_machine_name("has-dash"));
        assert!(!is_machine_name(""));
    }

    #[tokio::test]
    async fn test_role_crud() {
        let (svc, store) = service();
        let role = svc.create_role(role_req("editor"), None).await.unwrap();
        assert!(role.is_active);

        assert!(matches!(
            svc.create_role(role_req("editor"), None).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.create_role(role_req("Bad Name"), None).await,
            Err(ServiceError::Validation(_))
        ));

        let actor = Uuid::new_v4();
        let updated = svc
            .update_role(
                role.id,
                UpdateRoleRequest {
                    is_active: Some(false),
                    ..Default::default()
                },
                Some(actor),
            )
            .await
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(updated.updated_by, Some(actor));

        svc.delete_role(role.id).await.unwrap();
        assert!(matches!(
            svc.delete_role(role.id).await,
            Err(ServiceError::RoleNotFound)
        ));

        let events: Vec<_> = store
            .find_by_aggregate(&role.id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event_type)
            .collect();
        assert_eq!(events, vec!["role.created", "role.updated", "role.deleted"]);
    }

    #[tokio::test]
    async fn test_permission_name_is_derived() {
        let (svc, _) = service();
        let p = svc.create_permission(perm_req("Users", "read"), None).await.unwrap();
        assert_eq!(p.name, "users:read");
        assert!(matches!(
            svc.create_permission(perm_req("users", "READ"), None).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            svc.create_permission(perm_req("users", "read:all"), None).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let (svc, _) = service();
        let role = svc.create_role(role_req("editor"), None).await.unwrap();
        let read = svc.create_permission(perm_req("docs", "read"), None).await.unwrap();
        let write = svc.create_permission(perm_req("docs", "update"), None).await.unwrap();

        let granted = svc
            .grant_permissions(role.id, &[read.id, write.id], None)
            .await
            .unwrap();
        assert_eq!(granted, vec![read.id, write.id]);

        let (_, perms) = svc.role_detail(role.id).await.unwrap();
        assert_eq!(perms.len(), 2);

        svc.revoke_permission(role.id, read.id).await.unwrap();
        let (_, perms) = svc.role_detail(role.id).await.unwrap();
        assert_eq!(perms.len(), 1);
        assert!(svc.revoke_permission(role.id, read.id).await.is_err());

        assert!(matches!(
            svc.grant_permissions(role.id, &[Uuid::new_v4()], None).await,
            Err(ServiceError::PermissionNotFound)
        ));
    }

    #[tokio::test]
    async fn test_ensure_role_is_idempotent() {
        let (svc, _) = service();
        let first = svc.ensure_role("admin", "Administrator").await.unwrap();
        let second = svc.ensure_role("admin", "Administrator").await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
