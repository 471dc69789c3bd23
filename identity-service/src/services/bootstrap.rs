//! Startup seeding: the admin role, and optionally a first administrator.

use crate::{
    config::BootstrapConfig,
    dtos::user::{AssignRoleRequest, CreateUserRequest},
    services::{roles::RoleService, users::UserService, ServiceError},
};

/// Ensures `admin_role` exists. When both bootstrap credentials are set and
/// no account uses that email yet, creates a verified active user holding
/// the role.
pub async fn seed(
    roles: &RoleService,
    users: &UserService,
    admin_role: &str,
    config: &BootstrapConfig,
) -> Result<(), ServiceError> {
    let role = roles.ensure_role(admin_role, "Administrator").await?;

    let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password) else {
        return Ok(());
    };

    let created = users
        .create(
            CreateUserRequest {
                email: email.clone(),
                name: "Administrator".to_string(),
                phone: None,
                password: password.clone(),
                is_active: Some(true),
                email_verified: Some(true),
            },
            None,
        )
        .await;

    let admin = match created {
        Ok(user) => user,
        Err(ServiceError::EmailAlreadyRegistered) => {
            tracing::info!("Bootstrap administrator already present");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    users
        .assign_role(
            admin.id,
            AssignRoleRequest {
                role_id: role.id,
                expires_at: None,
            },
            None,
        )
        .await?;

    tracing::info!(user_id = %admin.id, role = %role.name, "Bootstrap administrator created");
    Ok(())
}
