//! Authorization gate. A route is guarded by an [`AccessPolicy`]; the
//! request passes when any one of its rules admits the caller.

use service_core::axum::{
    extract::{Path, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{middleware::auth::AuthContext, services::RbacEvaluator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessRule {
    Role(String),
    AnyRole(Vec<String>),
    AllRoles(Vec<String>),
    Permission { resource: String, action: String },
    PermissionName(String),
    /// The named path parameter equals the caller's id, or the caller holds
    /// an admin-equivalent role.
    Owner(&'static str),
    /// Permission derived from the request: resource from the path, action
    /// from the method.
    Dynamic,
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    rules: Vec<AccessRule>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, rule: AccessRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn permission(self, resource: &str, action: &str) -> Self {
        self.allow(AccessRule::Permission {
            resource: resource.to_string(),
            action: action.to_string(),
        })
    }

    pub fn rules(&self) -> &[AccessRule] {
        &self.rules
    }
}

/// State for [`authorize`]: the evaluator plus one route group's policy.
#[derive(Clone)]
pub struct AuthorizationGate {
    rbac: RbacEvaluator,
    admin_roles: Arc<Vec<String>>,
    policy: Arc<AccessPolicy>,
}

impl AuthorizationGate {
    pub fn new(rbac: RbacEvaluator, admin_roles: Arc<Vec<String>>, policy: AccessPolicy) -> Self {
        Self {
            rbac,
            admin_roles,
            policy: Arc::new(policy),
        }
    }

    /// Same evaluator and admin roles, different policy.
    pub fn with_policy(&self, policy: AccessPolicy) -> Self {
        Self {
            rbac: self.rbac.clone(),
            admin_roles: self.admin_roles.clone(),
            policy: Arc::new(policy),
        }
    }

    /// Policy admitting admin-equivalent roles, then `rules` in order.
    pub fn admin_or(&self, rules: impl IntoIterator<Item = AccessRule>) -> Self {
        let policy = rules.into_iter().fold(
            AccessPolicy::new().allow(AccessRule::AnyRole(self.admin_roles.to_vec())),
            AccessPolicy::allow,
        );
        self.with_policy(policy)
    }

    async fn admits(
        &self,
        rule: &AccessRule,
        ctx: &AuthContext,
        method: &Method,
        path: &str,
        params: &HashMap<String, String>,
    ) -> Result<bool, AppError> {
        let user_id = ctx.user.id;
        let allowed = match rule {
            AccessRule::Role(role) => self.rbac.user_has_role(user_id, role).await?,
            AccessRule::AnyRole(roles) => self.rbac.user_has_any_role(user_id, roles).await?,
            AccessRule::AllRoles(roles) => self.rbac.user_has_all_roles(user_id, roles).await?,
            AccessRule::Permission { resource, action } => {
                self.rbac
                    .user_has_permission(user_id, resource, action)
                    .await?
            }
            AccessRule::PermissionName(name) => {
                self.rbac.user_has_permission_by_name(user_id, name).await?
            }
            AccessRule::Owner(param) => {
                let is_owner = params
                    .get(*param)
                    .is_some_and(|value| value.eq_ignore_ascii_case(&user_id.to_string()));
                is_owner
                    || self
                        .rbac
                        .user_has_any_role(user_id, &self.admin_roles)
                        .await?
            }
            AccessRule::Dynamic => {
                let action = action_for_method(method)?;
                match resource_segment(path) {
                    Some(resource) => {
                        self.rbac
                            .user_has_permission(user_id, resource, action)
                            .await?
                    }
                    None => false,
                }
            }
        };
        Ok(allowed)
    }
}

/// GET→read, POST→create, PUT|PATCH→update, DELETE→delete.
pub fn action_for_method(method: &Method) -> Result<&'static str, AppError> {
    match *method {
        Method::GET | Method::HEAD => Ok("read"),
        Method::POST => Ok("create"),
        Method::PUT | Method::PATCH => Ok("update"),
        Method::DELETE => Ok("delete"),
        _ => Err(AppError::BadRequest(anyhow::anyhow!(
            "Unsupported method for authorization: {}",
            method
        ))),
    }
}

/// First segment after `/api/v{n}/`.
pub fn resource_segment(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "api" {
        return None;
    }
    let version = segments.next()?;
    let is_version = version
        .strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    if !is_version {
        return None;
    }
    segments.next().filter(|s| !s.is_empty())
}

/// Must run after the auth middleware.
pub async fn authorize(
    State(gate): State<AuthorizationGate>,
    params: Option<Path<HashMap<String, String>>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = req
        .extensions()
        .get::<AuthContext>()
        .cloned()
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))?;

    let params = params.map(|Path(p)| p).unwrap_or_default();
    for rule in gate.policy.rules() {
        if gate
            .admits(rule, &ctx, req.method(), req.uri().path(), &params)
            .await?
        {
            return Ok(next.run(req).await);
        }
    }

    tracing::info!(
        user_id = %ctx.user.id,
        method = %req.method(),
        path = %req.uri().path(),
        "Authorization denied"
    );
    Err(AppError::Forbidden(anyhow::anyhow!("Insufficient permissions")))
}
