//! In-process backend for the identity, outbox and inbox stores.
//!
//! One mutex guards every table, so an entity write and its outbox rows
//! become visible together.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::error::ServiceError;
use super::inbox::InboxStore;
use super::outbox::OutboxStore;
use super::store::{
    IdentityStore, NewAssignment, NewPermission, NewRole, PERMISSION_SORT_KEYS, ROLE_SORT_KEYS,
    USER_SORT_KEYS,
};
use crate::models::{
    InboxMessage, ListParams, NewOutboxMessage, NewUser, OutboxMessage, OutboxStatus, Page,
    Permission, Role, RolePermissionGrant, SortOrder, User, UserRoleAssignment,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    assignments: Vec<UserRoleAssignment>,
    grants: Vec<RolePermissionGrant>,
    outbox: Vec<OutboxMessage>,
    inbox: HashMap<(Uuid, String), InboxMessage>,
}

impl Tables {
    fn append_events(&mut self, events: &[NewOutboxMessage], now: DateTime<Utc>) {
        self.outbox
            .extend(events.iter().cloned().map(|e| e.into_pending(now)));
    }

    fn email_taken(&self, email: &str, except: Option<Uuid>) -> bool {
        let email = email.to_lowercase();
        self.users
            .values()
            .any(|u| Some(u.id) != except && u.email.to_lowercase() == email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Text(String),
    Time(DateTime<Utc>),
}

/// Sorts by `value` in `order`, ties broken by id ascending, then slices
/// out the requested page.
fn paginate<T>(
    mut items: Vec<T>,
    params: &ListParams,
    value: impl Fn(&T) -> SortValue,
    id: impl Fn(&T) -> Uuid,
) -> Page<T> {
    let desc = params.order() == SortOrder::Desc;
    items.sort_by(|a, b| {
        let ord = value(a).cmp(&value(b));
        let ord = if desc { ord.reverse() } else { ord };
        match ord {
            Ordering::Equal => id(a).cmp(&id(b)),
            other => other,
        }
    });

    let total = items.len() as i64;
    let offset = params.offset();
    let limit = params.limit();
    let items = items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();

    Page {
        items,
        total,
        offset,
        limit,
    }
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, ServiceError> {
        self.tables
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Memory store poisoned: {}", e)))
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.lock().map(|_| ())
    }

    async fn create_user(
        &self,
        user: NewUser,
        events: &[NewOutboxMessage],
    ) -> Result<User, ServiceError> {
        let mut tables = self.lock()?;
        if tables.email_taken(&user.email, None) {
            return Err(ServiceError::EmailAlreadyRegistered);
        }

        let now = Utc::now();
        let created = User {
            id: user.id,
            email: user.email,
            name: user.name,
            password_hash: user.password_hash,
            phone: user.phone,
            is_active: user.is_active,
            email_verified_at: user.email_verified.then_some(now),
            deactivated_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.users.insert(created.id, created.clone());
        tables.append_events(events, now);
        Ok(created)
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        let email = email.to_lowercase();
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned())
    }

    async fn update_user(
        &self,
        user: &User,
        events: &[NewOutboxMessage],
    ) -> Result<User, ServiceError> {
        let mut tables = self.lock()?;
        if !tables.users.contains_key(&user.id) {
            return Err(ServiceError::UserNotFound);
        }
        if tables.email_taken(&user.email, Some(user.id)) {
            return Err(ServiceError::EmailAlreadyRegistered);
        }

        let now = Utc::now();
        let mut updated = user.clone();
        updated.updated_at = now;
        tables.users.insert(updated.id, updated.clone());
        tables.append_events(events, now);
        Ok(updated)
    }

    async fn hard_delete_user(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        if tables.users.remove(&id).is_none() {
            return Ok(false);
        }
        tables.assignments.retain(|a| a.user_id != id);
        tables.append_events(events, Utc::now());
        Ok(true)
    }

    async fn list_users(&self, params: &ListParams) -> Result<Page<User>, ServiceError> {
        let sort = params
            .sort_key(USER_SORT_KEYS, "created_at")
            .map_err(ServiceError::Validation)?;
        let search = params.search_term();

        let users: Vec<User> = self
            .lock()?
            .users
            .values()
            .filter(|u| u.deleted_at.is_none())
            .filter(|u| params.is_active.map_or(true, |a| u.is_active == a))
            .filter(|u| {
                search
                    .as_deref()
                    .map_or(true, |s| contains(&u.email, s) || contains(&u.name, s))
            })
            .cloned()
            .collect();

        Ok(paginate(
            users,
            params,
            |u| match sort {
                "email" => SortValue::Text(u.email.to_lowercase()),
                "name" => SortValue::Text(u.name.clone()),
                "updated_at" => SortValue::Time(u.updated_at),
                _ => SortValue::Time(u.created_at),
            },
            |u| u.id,
        ))
    }

    async fn create_role(
        &self,
        role: NewRole,
        events: &[NewOutboxMessage],
    ) -> Result<Role, ServiceError> {
        let mut tables = self.lock()?;
        if tables.roles.values().any(|r| r.name == role.name) {
            return Err(ServiceError::Conflict(format!(
                "Role '{}' already exists",
                role.name
            )));
        }

        let now = Utc::now();
        let created = Role {
            id: role.id,
            name: role.name,
            display_name: role.display_name,
            description: role.description,
            is_active: role.is_active,
            created_by: role.created_by,
            updated_by: role.created_by,
            created_at: now,
            updated_at: now,
        };
        tables.roles.insert(created.id, created.clone());
        tables.append_events(events, now);
        Ok(created)
    }

    async fn find_role_by_id(&self, id: Uuid) -> Result<Option<Role>, ServiceError> {
        Ok(self.lock()?.roles.get(&id).cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, ServiceError> {
        Ok(self
            .lock()?
            .roles
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn update_role(
        &self,
        role: &Role,
        events: &[NewOutboxMessage],
    ) -> Result<Role, ServiceError> {
        let mut tables = self.lock()?;
        if !tables.roles.contains_key(&role.id) {
            return Err(ServiceError::RoleNotFound);
        }
        if tables
            .roles
            .values()
            .any(|r| r.id != role.id && r.name == role.name)
        {
            return Err(ServiceError::Conflict(format!(
                "Role '{}' already exists",
                role.name
            )));
        }

        let now = Utc::now();
        let mut updated = role.clone();
        updated.updated_at = now;
        tables.roles.insert(updated.id, updated.clone());
        tables.append_events(events, now);
        Ok(updated)
    }

    async fn delete_role(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        if tables.roles.remove(&id).is_none() {
            return Ok(false);
        }
        tables.grants.retain(|g| g.role_id != id);
        tables.assignments.retain(|a| a.role_id != id);
        tables.append_events(events, Utc::now());
        Ok(true)
    }

    async fn list_roles(&self, params: &ListParams) -> Result<Page<Role>, ServiceError> {
        let sort = params
            .sort_key(ROLE_SORT_KEYS, "name")
            .map_err(ServiceError::Validation)?;
        let search = params.search_term();

        let roles: Vec<Role> = self
            .lock()?
            .roles
            .values()
            .filter(|r| params.is_active.map_or(true, |a| r.is_active == a))
            .filter(|r| {
                search
                    .as_deref()
                    .map_or(true, |s| contains(&r.name, s) || contains(&r.display_name, s))
            })
            .cloned()
            .collect();

        Ok(paginate(
            roles,
            params,
            |r| match sort {
                "display_name" => SortValue::Text(r.display_name.clone()),
                "created_at" => SortValue::Time(r.created_at),
                "updated_at" => SortValue::Time(r.updated_at),
                _ => SortValue::Text(r.name.clone()),
            },
            |r| r.id,
        ))
    }

    async fn create_permission(
        &self,
        permission: NewPermission,
        events: &[NewOutboxMessage],
    ) -> Result<Permission, ServiceError> {
        let mut tables = self.lock()?;
        let name = permission.name();
        if tables.permissions.values().any(|p| p.name == name) {
            return Err(ServiceError::Conflict(format!(
                "Permission '{}' already exists",
                name
            )));
        }

        let now = Utc::now();
        let created = Permission {
            id: permission.id,
            name,
            resource: permission.resource,
            action: permission.action,
            description: permission.description,
            is_active: permission.is_active,
            created_by: permission.created_by,
            updated_by: permission.created_by,
            created_at: now,
            updated_at: now,
        };
        tables.permissions.insert(created.id, created.clone());
        tables.append_events(events, now);
        Ok(created)
    }

    async fn find_permission_by_id(&self, id: Uuid) -> Result<Option<Permission>, ServiceError> {
        Ok(self.lock()?.permissions.get(&id).cloned())
    }

    async fn find_permission(
        &self,
        resource: &str,
        action: &str,
    ) -> Result<Option<Permission>, ServiceError> {
        Ok(self
            .lock()?
            .permissions
            .values()
            .find(|p| p.resource == resource && p.action == action)
            .cloned())
    }

    async fn update_permission(
        &self,
        permission: &Permission,
        events: &[NewOutboxMessage],
    ) -> Result<Permission, ServiceError> {
        let mut tables = self.lock()?;
        if !tables.permissions.contains_key(&permission.id) {
            return Err(ServiceError::PermissionNotFound);
        }

        let mut updated = permission.clone();
        updated.name = Permission::canonical_name(&updated.resource, &updated.action);
        if tables
            .permissions
            .values()
            .any(|p| p.id != updated.id && p.name == updated.name)
        {
            return Err(ServiceError::Conflict(format!(
                "Permission '{}' already exists",
                updated.name
            )));
        }

        let now = Utc::now();
        updated.updated_at = now;
        tables.permissions.insert(updated.id, updated.clone());
        tables.append_events(events, now);
        Ok(updated)
    }

    async fn delete_permission(
        &self,
        id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        if tables.permissions.remove(&id).is_none() {
            return Ok(false);
        }
        tables.grants.retain(|g| g.permission_id != id);
        tables.append_events(events, Utc::now());
        Ok(true)
    }

    async fn list_permissions(
        &self,
        params: &ListParams,
    ) -> Result<Page<Permission>, ServiceError> {
        let sort = params
            .sort_key(PERMISSION_SORT_KEYS, "name")
            .map_err(ServiceError::Validation)?;
        let search = params.search_term();

        let permissions: Vec<Permission> = self
            .lock()?
            .permissions
            .values()
            .filter(|p| params.is_active.map_or(true, |a| p.is_active == a))
            .filter(|p| params.resource.as_deref().map_or(true, |r| p.resource == r))
            .filter(|p| params.action.as_deref().map_or(true, |a| p.action == a))
            .filter(|p| {
                search.as_deref().map_or(true, |s| {
                    contains(&p.name, s)
                        || p.description.as_deref().is_some_and(|d| contains(d, s))
                })
            })
            .cloned()
            .collect();

        Ok(paginate(
            permissions,
            params,
            |p| match sort {
                "resource" => SortValue::Text(p.resource.clone()),
                "action" => SortValue::Text(p.action.clone()),
                "created_at" => SortValue::Time(p.created_at),
                "updated_at" => SortValue::Time(p.updated_at),
                _ => SortValue::Text(p.name.clone()),
            },
            |p| p.id,
        ))
    }

    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        granted_by: Option<Uuid>,
        events: &[NewOutboxMessage],
    ) -> Result<RolePermissionGrant, ServiceError> {
        let mut tables = self.lock()?;
        if !tables.roles.contains_key(&role_id) {
            return Err(ServiceError::RoleNotFound);
        }
        if !tables.permissions.contains_key(&permission_id) {
            return Err(ServiceError::PermissionNotFound);
        }

        let now = Utc::now();
        let grant = match tables
            .grants
            .iter_mut()
            .find(|g| g.role_id == role_id && g.permission_id == permission_id)
        {
            Some(existing) => {
                existing.is_active = true;
                existing.granted_by = granted_by;
                existing.granted_at = now;
                existing.clone()
            }
            None => {
                let grant = RolePermissionGrant {
                    role_id,
                    permission_id,
                    granted_by,
                    granted_at: now,
                    is_active: true,
                };
                tables.grants.push(grant.clone());
                grant
            }
        };
        tables.append_events(events, now);
        Ok(grant)
    }

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        let Some(grant) = tables
            .grants
            .iter_mut()
            .find(|g| g.role_id == role_id && g.permission_id == permission_id && g.is_active)
        else {
            return Ok(false);
        };
        grant.is_active = false;
        tables.append_events(events, Utc::now());
        Ok(true)
    }

    async fn assign_role(
        &self,
        assignment: NewAssignment,
        events: &[NewOutboxMessage],
    ) -> Result<UserRoleAssignment, ServiceError> {
        let mut tables = self.lock()?;
        if !tables.users.contains_key(&assignment.user_id) {
            return Err(ServiceError::UserNotFound);
        }
        if !tables.roles.contains_key(&assignment.role_id) {
            return Err(ServiceError::RoleNotFound);
        }

        let now = Utc::now();
        let result = match tables
            .assignments
            .iter_mut()
            .find(|a| a.user_id == assignment.user_id && a.role_id == assignment.role_id)
        {
            Some(existing) => {
                existing.is_active = true;
                existing.assigned_by = assignment.assigned_by;
                existing.assigned_at = now;
                existing.expires_at = assignment.expires_at;
                existing.version += 1;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let created = UserRoleAssignment {
                    id: Uuid::new_v4(),
                    user_id: assignment.user_id,
                    role_id: assignment.role_id,
                    assigned_by: assignment.assigned_by,
                    assigned_at: now,
                    expires_at: assignment.expires_at,
                    is_active: true,
                    version: 1,
                    updated_at: now,
                };
                tables.assignments.push(created.clone());
                created
            }
        };
        tables.append_events(events, now);
        Ok(result)
    }

    async fn unassign_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        events: &[NewOutboxMessage],
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let Some(assignment) = tables
            .assignments
            .iter_mut()
            .find(|a| a.user_id == user_id && a.role_id == role_id && a.is_active)
        else {
            return Ok(false);
        };
        assignment.is_active = false;
        assignment.version += 1;
        assignment.updated_at = now;
        tables.append_events(events, now);
        Ok(true)
    }

    async fn assignments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<UserRoleAssignment>, ServiceError> {
        let mut assignments: Vec<UserRoleAssignment> = self
            .lock()?
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| a.assigned_at);
        Ok(assignments)
    }

    async fn effective_roles_for(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Role>, ServiceError> {
        let tables = self.lock()?;
        let mut roles: Vec<Role> = tables
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id && a.is_effective(now))
            .filter_map(|a| tables.roles.get(&a.role_id))
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn active_permissions_for_role(
        &self,
        role_id: Uuid,
    ) -> Result<Vec<Permission>, ServiceError> {
        let tables = self.lock()?;
        let mut permissions: Vec<Permission> = tables
            .grants
            .iter()
            .filter(|g| g.role_id == role_id && g.is_active)
            .filter_map(|g| tables.permissions.get(&g.permission_id))
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(permissions)
    }

    async fn role_has(
        &self,
        resource: &str,
        action: &str,
        role_id: Uuid,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .active_permissions_for_role(role_id)
            .await?
            .iter()
            .any(|p| p.resource == resource && p.action == action))
    }

    async fn role_has_by_name(
        &self,
        role_id: Uuid,
        permission_name: &str,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .active_permissions_for_role(role_id)
            .await?
            .iter()
            .any(|p| p.name == permission_name))
    }

    async fn cleanup_expired_assignments(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut tables = self.lock()?;
        let mut cleaned = 0;
        for a in tables
            .assignments
            .iter_mut()
            .filter(|a| a.is_active && a.expires_at.is_some_and(|exp| exp <= now))
        {
            a.is_active = false;
            a.version += 1;
            a.updated_at = now;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage, ServiceError> {
        let row = message.into_pending(Utc::now());
        self.lock()?.outbox.push(row.clone());
        Ok(row)
    }

    async fn drain(
        &self,
        batch_size: i64,
        worker_id: &str,
    ) -> Result<Vec<OutboxMessage>, ServiceError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let mut pending: Vec<&mut OutboxMessage> = tables
            .outbox
            .iter_mut()
            .filter(|m| m.status == OutboxStatus::Pending)
            .collect();
        pending.sort_by_key(|m| m.created_at);

        Ok(pending
            .into_iter()
            .take(batch_size.max(0) as usize)
            .map(|m| {
                m.status = OutboxStatus::Inflight;
                m.claimed_by = Some(worker_id.to_string());
                m.claimed_at = Some(now);
                m.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, id: Uuid, worker_id: &str) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        let Some(m) = tables.outbox.iter_mut().find(|m| m.is_claimed_by(id, worker_id)) else {
            return Ok(false);
        };
        m.status = OutboxStatus::Processed;
        m.processed_at = Some(Utc::now());
        m.claimed_by = None;
        m.claimed_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        let Some(m) = tables.outbox.iter_mut().find(|m| m.is_claimed_by(id, worker_id)) else {
            return Ok(false);
        };
        m.status = OutboxStatus::Failed;
        m.retries += 1;
        m.last_error = Some(error.to_string());
        m.claimed_by = None;
        m.claimed_at = None;
        Ok(true)
    }

    async fn retry_failed(&self, batch_size: i64) -> Result<Vec<OutboxMessage>, ServiceError> {
        let mut tables = self.lock()?;
        Ok(tables
            .outbox
            .iter_mut()
            .filter(|m| m.status == OutboxStatus::Failed && m.retries < m.max_retries)
            .take(batch_size.max(0) as usize)
            .map(|m| {
                m.status = OutboxStatus::Pending;
                m.clone()
            })
            .collect())
    }

    async fn release_stale(&self, older_than: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut tables = self.lock()?;
        let mut released = 0;
        for m in tables.outbox.iter_mut().filter(|m| {
            m.status == OutboxStatus::Inflight && m.claimed_at.is_some_and(|c| c < older_than)
        }) {
            m.status = OutboxStatus::Pending;
            m.claimed_by = None;
            m.claimed_at = None;
            released += 1;
        }
        Ok(released)
    }

    async fn cleanup(&self, older_than_days: i64) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let mut tables = self.lock()?;
        let before = tables.outbox.len();
        tables.outbox.retain(|m| {
            !(m.status == OutboxStatus::Processed && m.processed_at.is_some_and(|p| p < cutoff))
        });
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxMessage>, ServiceError> {
        Ok(self.lock()?.outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn find_by_aggregate(
        &self,
        aggregate_id: &str,
    ) -> Result<Vec<OutboxMessage>, ServiceError> {
        let mut rows: Vec<OutboxMessage> = self
            .lock()?
            .outbox
            .iter()
            .filter(|m| m.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl InboxStore for MemoryStore {
    async fn try_insert(
        &self,
        message_id: Uuid,
        event_type: &str,
        consumer_id: &str,
        ttl_seconds: u64,
    ) -> Result<bool, ServiceError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let key = (message_id, consumer_id.to_string());

        if tables
            .inbox
            .get(&key)
            .is_some_and(|row| row.expires_at > now)
        {
            return Ok(false);
        }

        tables.inbox.insert(
            key,
            InboxMessage {
                message_id,
                consumer_id: consumer_id.to_string(),
                event_type: event_type.to_string(),
                first_seen_at: now,
                expires_at: now + Duration::seconds(ttl_seconds as i64),
            },
        );
        Ok(true)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut tables = self.lock()?;
        let before = tables.inbox.len();
        tables.inbox.retain(|_, row| row.expires_at > now);
        Ok((before - tables.inbox.len()) as u64)
    }
}
