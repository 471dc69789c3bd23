//! Role-based access decisions, recomputed from the store on every call.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use super::error::ServiceError;
use super::store::IdentityStore;
use crate::models::{Permission, Role};

/// A permission together with the role that grants it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EffectivePermission {
    pub id: Uuid,
    pub name: String,
    pub resource: String,
    pub action: String,
    pub granted_by_role: String,
}

#[derive(Clone)]
pub struct RbacEvaluator {
    store: Arc<dyn IdentityStore>,
}

impl RbacEvaluator {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    async fn effective_roles(&self, user_id: Uuid) -> Result<Vec<Role>, ServiceError> {
        self.store.effective_roles_for(user_id, Utc::now()).await
    }

    pub async fn user_has_permission(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
    ) -> Result<bool, ServiceError> {
        for role in self.effective_roles(user_id).await? {
            if self.store.role_has(resource, action, role.id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn user_has_permission_by_name(
        &self,
        user_id: Uuid,
        permission_name: &str,
    ) -> Result<bool, ServiceError> {
        for role in self.effective_roles(user_id).await? {
            if self.store.role_has_by_name(role.id, permission_name).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn user_has_role(&self, user_id: Uuid, role_name: &str) -> Result<bool, ServiceError> {
        Ok(self
            .effective_roles(user_id)
            .await?
            .iter()
            .any(|r| r.name == role_name))
    }

    /// `false` for an empty list.
    pub async fn user_has_any_role(
        &self,
        user_id: Uuid,
        role_names: &[String],
    ) -> Result<bool, ServiceError> {
        if role_names.is_empty() {
            return Ok(false);
        }
        let held = self.roles_of(user_id).await?;
        Ok(role_names.iter().any(|name| held.contains(name)))
    }

    /// Vacuously `true` for an empty list.
    pub async fn user_has_all_roles(
        &self,
        user_id: Uuid,
        role_names: &[String],
    ) -> Result<bool, ServiceError> {
        if role_names.is_empty() {
            return Ok(true);
        }
        let held = self.roles_of(user_id).await?;
        Ok(role_names.iter().all(|name| held.contains(name)))
    }

    /// Union of active permissions over effective roles, each listed once.
    pub async fn permissions_of(&self, user_id: Uuid) -> Result<Vec<Permission>, ServiceError> {
        let mut seen = HashSet::new();
        let mut permissions = Vec::new();
        for role in self.effective_roles(user_id).await? {
            for permission in self.store.active_permissions_for_role(role.id).await? {
                if seen.insert(permission.id) {
                    permissions.push(permission);
                }
            }
        }
        Ok(permissions)
    }

    /// Names of effective roles, ordered by name.
    pub async fn roles_of(&self, user_id: Uuid) -> Result<Vec<String>, ServiceError> {
        let mut names: Vec<String> = self
            .effective_roles(user_id)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.dedup();
        Ok(names)
    }

    pub async fn can_access(
        &self,
        user_id: Uuid,
        resource: &str,
        action: &str,
    ) -> Result<(), ServiceError> {
        if self.user_has_permission(user_id, resource, action).await? {
            Ok(())
        } else {
            tracing::debug!(user_id = %user_id, resource, action, "Access denied");
            Err(ServiceError::PermissionDenied)
        }
    }

    /// Like [`permissions_of`](Self::permissions_of), tagging each permission
    /// with the first role (by name) that grants it.
    pub async fn effective_permissions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<EffectivePermission>, ServiceError> {
        let mut seen = HashSet::new();
        let mut effective = Vec::new();
        for role in self.effective_roles(user_id).await? {
            for permission in self.store.active_permissions_for_role(role.id).await? {
                if seen.insert(permission.id) {
                    effective.push(EffectivePermission {
                        id: permission.id,
                        name: permission.name,
                        resource: permission.resource,
                        action: permission.action,
                        granted_by_role: role.name.clone(),
                    });
                }
            }
        }
        Ok(effective)
    }
}
