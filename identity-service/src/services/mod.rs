//! Services layer for the identity service.
//!
//! Stores, caches and publishers sit behind traits; the business services
//! (auth, users, roles, RBAC) only see those traits.

pub mod auth;
pub mod bootstrap;
pub mod cache;
mod database;
pub mod email;
pub mod error;
pub mod inbox;
pub mod jwt;
pub mod memory;
pub mod metrics;
pub mod outbox;
pub mod policy;
pub mod rbac;
pub mod roles;
pub mod store;
pub mod users;

pub use auth::AuthService;
pub use cache::{InMemoryCache, RedisService, TrustCache};
pub use database::Database;
pub use email::{EmailProvider, EmailService, MockEmailService};
pub use error::ServiceError;
pub use inbox::{CacheInboxStore, InboxService, InboxStore};
pub use jwt::{Claims, JwtService, TokenResponse, TokenType};
pub use memory::MemoryStore;
pub use outbox::{
    MessagePublisher, OutboxProcessor, OutboxStore, RecordingPublisher, RedisStreamPublisher,
};
pub use rbac::{EffectivePermission, RbacEvaluator};
pub use roles::RoleService;
pub use store::IdentityStore;
pub use users::UserService;
