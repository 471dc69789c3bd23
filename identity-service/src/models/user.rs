//! User accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle state derived from the stored flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Unverified,
    Active,
    Inactive,
    Deleted,
}

impl UserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::Unverified => "unverified",
            UserState::Active => "active",
            UserState::Inactive => "inactive",
            UserState::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    /// Set by an admin deactivation; only an admin activation clears it.
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn state(&self) -> UserState {
        if self.deleted_at.is_some() {
            UserState::Deleted
        } else if self.is_active {
            UserState::Active
        } else if self.deactivated_at.is_none() && self.email_verified_at.is_none() {
            UserState::Unverified
        } else {
            UserState::Inactive
        }
    }

    /// Login and token validation are only allowed for active accounts.
    pub fn can_authenticate(&self) -> bool {
        self.state() == UserState::Active
    }

    pub fn is_verified(&self) -> bool {
        self.email_verified_at.is_some()
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated_at.is_some()
    }

    pub fn sanitized(&self) -> UserResponse {
        UserResponse::from(self.clone())
    }
}

/// Values needed to insert a user; ids and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
}

/// User as returned by the API (no password hash).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub state: UserState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        let state = u.state();
        Self {
            id: u.id,
            email: u.email,
            name: u.name,
            phone: u.phone,
            is_active: u.is_active,
            email_verified: u.email_verified_at.is_some(),
            state,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}
