pub mod auth;
pub mod authorization;
pub mod idempotency;

pub use auth::{auth_middleware, AuthContext, AuthUser};
pub use authorization::{authorize, AccessPolicy, AccessRule, AuthorizationGate};
pub use idempotency::{idempotency_middleware, IdempotencyContext, IdempotencyGate};
