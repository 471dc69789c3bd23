//! HTTP handlers for the identity service.

pub mod auth;
pub mod metrics;
pub mod permission;
pub mod role;
pub mod user;
