pub mod inbox;
pub mod outbox;
pub mod pagination;
pub mod role;
pub mod user;
pub mod verification_token;

pub use inbox::InboxMessage;
pub use outbox::{NewOutboxMessage, OutboxMessage, OutboxStatus};
pub use pagination::{ListParams, Page, SortOrder};
pub use role::{
    Permission, PermissionResponse, Role, RolePermissionGrant, RoleResponse, UserRoleAssignment,
};
pub use user::{NewUser, User, UserResponse, UserState};
pub use verification_token::TokenPurpose;
