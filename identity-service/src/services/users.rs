//! Administrative user management. Every state change is written together
//! with its `user.*` or `assignment.*` outbox event.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    dtos::user::{AssignRoleRequest, CreateUserRequest, UpdateUserRequest},
    models::{ListParams, NewOutboxMessage, NewUser, Page, User, UserRoleAssignment},
    services::{
        policy::PasswordPolicy,
        store::{IdentityStore, NewAssignment},
        ServiceError,
    },
    utils::{hash_password, Password},
};

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn IdentityStore>,
    password_policy: PasswordPolicy,
    outbox_max_retries: i32,
}

impl UserService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        password_policy: PasswordPolicy,
        outbox_max_retries: i32,
    ) -> Self {
        Self {
            store,
            password_policy,
            outbox_max_retries,
        }
    }

    fn event(
        &self,
        event_type: &str,
        aggregate_id: impl ToString,
        data: serde_json::Value,
    ) -> Result<NewOutboxMessage, ServiceError> {
        NewOutboxMessage::json(event_type, aggregate_id, &data, self.outbox_max_retries)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode event: {}", e)))
    }

    pub async fn create(
        &self,
        req: CreateUserRequest,
        actor: Option<Uuid>,
    ) -> Result<User, ServiceError> {
        self.password_policy.validate(&req.password)?;

        let email = req.email.trim().to_lowercase();
        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(ServiceError::EmailAlreadyRegistered);
        }

        let password_hash = hash_password(&Password::new(req.password))
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))?
            .into_string();

        let id = Uuid::new_v4();
        let event = self.event(
            "user.created",
            id,
            json!({ "user_id": id, "email": email, "name": req.name, "created_by": actor }),
        )?;

        let user = self
            .store
            .create_user(
                NewUser {
                    id,
                    email,
                    name: req.name,
                    password_hash,
                    phone: req.phone,
                    is_active: req.is_active.unwrap_or(true),
                    email_verified: req.email_verified.unwrap_or(false),
                },
                &[event],
            )
            .await?;

        tracing::info!(user_id = %user.id, actor = ?actor, "User created by administrator");
        Ok(user)
    }

    /// Soft-deleted users read as not found.
    pub async fn get(&self, id: Uuid) -> Result<User, ServiceError> {
        self.store
            .find_user_by_id(id)
            .await?
            .filter(|u| u.deleted_at.is_none())
            .ok_or(ServiceError::UserNotFound)
    }

    pub async fn list(&self, params: &ListParams) -> Result<Page<User>, ServiceError> {
        self.store.list_users(params).await
    }

    pub async fn update(&self, id: Uuid, req: UpdateUserRequest) -> Result<User, ServiceError> {
        let mut user = self.get(id).await?;
        let mut changed = Vec::new();

        if let Some(email) = req.email {
            let email = email.trim().to_lowercase();
            if email != user.email {
                if let Some(existing) = self.store.find_user_by_email(&email).await? {
                    if existing.id != id {
                        return Err(ServiceError::EmailAlreadyRegistered);
                    }
                }
                user.email = email;
                changed.push("email");
            }
        }
        if let Some(name) = req.name {
            user.name = name;
            changed.push("name");
        }
        if let Some(phone) = req.phone {
            user.phone = Some(phone);
            changed.push("phone");
        }

        if changed.is_empty() {
            return Ok(user);
        }

        let event = self.event(
            "user.updated",
            id,
            json!({ "user_id": id, "fields": changed }),
        )?;
        let user = self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %id, fields = ?changed, "User updated");
        Ok(user)
    }

    pub async fn activate(&self, id: Uuid) -> Result<User, ServiceError> {
        self.set_active(id, true).await
    }

    pub async fn deactivate(&self, id: Uuid) -> Result<User, ServiceError> {
        self.set_active(id, false).await
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<User, ServiceError> {
        let mut user = self.get(id).await?;
        // an unverified account is already inactive but not yet deactivated
        if user.is_active == active && user.is_deactivated() != active {
            return Ok(user);
        }

        user.is_active = active;
        user.deactivated_at = if active { None } else { Some(Utc::now()) };
        let event_type = if active {
            "user.activated"
        } else {
            "user.deactivated"
        };
        let event = self.event(event_type, id, json!({ "user_id": id }))?;
        let user = self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %id, active, "User activation changed");
        Ok(user)
    }

    /// Marks the user deleted; the row stays for audit.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let mut user = self.get(id).await?;
        user.is_active = false;
        user.deleted_at = Some(Utc::now());

        let event = self.event("user.deleted", id, json!({ "user_id": id, "hard": false }))?;
        self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %id, "User soft-deleted");
        Ok(())
    }

    /// Removes the row and its role assignments.
    pub async fn hard_delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let event = self.event("user.deleted", id, json!({ "user_id": id, "hard": true }))?;
        if !self.store.hard_delete_user(id, &[event]).await? {
            return Err(ServiceError::UserNotFound);
        }

        tracing::info!(user_id = %id, "User hard-deleted");
        Ok(())
    }

    pub async fn assign_role(
        &self,
        user_id: Uuid,
        req: AssignRoleRequest,
        actor: Option<Uuid>,
    ) -> Result<UserRoleAssignment, ServiceError> {
        self.get(user_id).await?;
        if let Some(expires_at) = req.expires_at {
            if expires_at <= Utc::now() {
                return Err(ServiceError::Validation(
                    "expires_at must be in the future".to_string(),
                ));
            }
        }

        let event = self.event(
            "assignment.created",
            user_id,
            json!({
                "user_id": user_id,
                "role_id": req.role_id,
                "assigned_by": actor,
                "expires_at": req.expires_at,
            }),
        )?;
        let assignment = self
            .store
            .assign_role(
                NewAssignment {
                    user_id,
                    role_id: req.role_id,
                    assigned_by: actor,
                    expires_at: req.expires_at,
                },
                &[event],
            )
            .await?;

        tracing::info!(user_id = %user_id, role_id = %req.role_id, "Role assigned");
        Ok(assignment)
    }

    pub async fn unassign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), ServiceError> {
        let event = self.event(
            "assignment.revoked",
            user_id,
            json!({ "user_id": user_id, "role_id": role_id }),
        )?;
        if !self.store.unassign_role(user_id, role_id, &[event]).await? {
            return Err(ServiceError::AssignmentNotFound);
        }

        tracing::info!(user_id = %user_id, role_id = %role_id, "Role unassigned");
        Ok(())
    }
}
