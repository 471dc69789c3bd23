use chrono::Utc;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    config::AuthSettings,
    dtos::auth::{AuthResponse, LoginRequest, RegisterRequest},
    models::{NewOutboxMessage, NewUser, TokenPurpose, User, UserResponse},
    services::{
        cache::TrustCache,
        email::EmailProvider,
        jwt::{Claims, JwtService, TokenResponse, TokenType},
        store::IdentityStore,
        ServiceError,
    },
    utils::{dummy_verify, hash_password, verify_password, Password, PasswordHashString},
};

const TOKEN_DENYLIST_PREFIX: &str = "blacklist:token:";
const USER_REVOCATION_PREFIX: &str = "blacklist:user:";

pub fn denylist_key(token: &str) -> String {
    format!("{}{}", TOKEN_DENYLIST_PREFIX, token)
}

pub fn user_revocation_key(user_id: Uuid) -> String {
    format!("{}{}", USER_REVOCATION_PREFIX, user_id)
}

/// 256 random bits, hex encoded.
fn generate_random_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn TrustCache>,
    email: Arc<dyn EmailProvider>,
    jwt: JwtService,
    settings: AuthSettings,
    outbox_max_retries: i32,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        cache: Arc<dyn TrustCache>,
        email: Arc<dyn EmailProvider>,
        jwt: JwtService,
        settings: AuthSettings,
        outbox_max_retries: i32,
    ) -> Self {
        Self {
            store,
            cache,
            email,
            jwt,
            settings,
            outbox_max_retries,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    fn event(
        &self,
        event_type: &str,
        user_id: Uuid,
        data: serde_json::Value,
    ) -> Result<NewOutboxMessage, ServiceError> {
        NewOutboxMessage::json(event_type, user_id, &data, self.outbox_max_retries)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode event: {}", e)))
    }

    fn hash(&self, password: &str) -> Result<String, ServiceError> {
        hash_password(&Password::new(password.to_string()))
            .map(PasswordHashString::into_string)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Password hashing error: {}", e)))
    }

    pub async fn register(&self, req: RegisterRequest) -> Result<AuthResponse, ServiceError> {
        self.settings.password_policy.validate(&req.password)?;

        let email = normalize_email(&req.email);
        if self.store.find_user_by_email(&email).await?.is_some() {
            return Err(ServiceError::EmailAlreadyRegistered);
        }

        let user_id = Uuid::new_v4();
        let created = self.event(
            "user.created",
            user_id,
            json!({ "user_id": user_id, "email": email, "name": req.name }),
        )?;

        let user = self
            .store
            .create_user(
                NewUser {
                    id: user_id,
                    email,
                    name: req.name,
                    password_hash: self.hash(&req.password)?,
                    phone: req.phone,
                    is_active: !self.settings.require_email_verification,
                    email_verified: false,
                },
                &[created],
            )
            .await?;

        tracing::info!(user_id = %user.id, "User registered");

        self.send_verification(&user).await;

        let tokens = self.jwt.issue_pair(user.id, &user.email)?;
        Ok(AuthResponse {
            user: user.sanitized(),
            tokens,
        })
    }

    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse, ServiceError> {
        let password = Password::new(req.password);
        let email = normalize_email(&req.email);

        let Some(user) = self.store.find_user_by_email(&email).await? else {
            dummy_verify(&password);
            tracing::info!("Login failed");
            return Err(ServiceError::InvalidCredentials);
        };

        let hash = PasswordHashString::new(user.password_hash.clone());
        if verify_password(&password, &hash).is_err() {
            tracing::info!(user_id = %user.id, "Login failed: bad password");
            return Err(ServiceError::InvalidCredentials);
        }

        if !user.can_authenticate() {
            tracing::info!(user_id = %user.id, state = user.state().as_str(), "Login refused for user state");
            return Err(ServiceError::InvalidCredentials);
        }

        let tokens = self.jwt.issue_pair(user.id, &user.email)?;
        tracing::info!(user_id = %user.id, "User logged in");

        Ok(AuthResponse {
            user: user.sanitized(),
            tokens,
        })
    }

    /// New access token for a refresh token; the refresh token itself and
    /// its expiry are returned unchanged.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ServiceError> {
        if self.cache.exists(&denylist_key(refresh_token)).await? {
            return Err(ServiceError::InvalidToken);
        }

        let claims = self
            .jwt
            .validate(refresh_token)
            .map_err(|_| ServiceError::InvalidToken)?;
        if claims.typ != TokenType::Refresh {
            return Err(ServiceError::InvalidToken);
        }
        let user_id = claims.user_id().map_err(|_| ServiceError::InvalidToken)?;

        if self.revoked_for_user(&claims, user_id).await? {
            return Err(ServiceError::InvalidToken);
        }
        self.active_user(user_id).await?;

        let access_token = self
            .jwt
            .refresh_access(refresh_token)
            .map_err(|_| ServiceError::InvalidToken)?;

        tracing::info!(user_id = %user_id, "Access token refreshed");

        Ok(TokenResponse {
            access_token,
            refresh_token: refresh_token.to_string(),
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
            refresh_expires_at: claims.exp,
        })
    }

    /// Denylists the access token, and the refresh token when it belongs to
    /// the same subject. Expired or foreign tokens are skipped.
    pub async fn logout(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), ServiceError> {
        let subject = self.denylist(access_token).await?;

        if let (Some(refresh), Some(sub)) = (refresh_token, subject.as_deref()) {
            match self.jwt.validate(refresh) {
                Ok(claims) if claims.typ == TokenType::Refresh && claims.sub == sub => {
                    self.denylist(refresh).await?;
                }
                _ => tracing::debug!("Ignoring refresh token on logout"),
            }
        }

        if let Some(sub) = subject {
            tracing::info!(user_id = %sub, "User logged out");
        }
        Ok(())
    }

    /// Revokes every token of `user_id` issued up to now, including the
    /// presented one.
    pub async fn logout_all(&self, user_id: Uuid, access_token: &str) -> Result<(), ServiceError> {
        let ttl = self.jwt.refresh_token_expiry_seconds().max(1) as u64;
        self.cache
            .set(
                &user_revocation_key(user_id),
                &Utc::now().timestamp_millis().to_string(),
                ttl,
            )
            .await?;
        self.denylist(access_token).await?;

        tracing::info!(user_id = %user_id, "All sessions revoked");
        Ok(())
    }

    /// Resolves an access token to its active user.
    pub async fn validate_token(&self, token: &str) -> Result<(User, Claims), ServiceError> {
        if self.cache.exists(&denylist_key(token)).await? {
            return Err(ServiceError::InvalidToken);
        }

        let claims = self
            .jwt
            .validate(token)
            .map_err(|_| ServiceError::InvalidToken)?;
        if claims.typ != TokenType::Access {
            return Err(ServiceError::InvalidToken);
        }
        let user_id = claims.user_id().map_err(|_| ServiceError::InvalidToken)?;

        if self.revoked_for_user(&claims, user_id).await? {
            return Err(ServiceError::InvalidToken);
        }

        let user = self.active_user(user_id).await?;
        Ok((user, claims))
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .filter(|u| u.deleted_at.is_none())
            .ok_or(ServiceError::UserNotFound)?;

        let hash = PasswordHashString::new(user.password_hash.clone());
        if verify_password(&Password::new(current_password.to_string()), &hash).is_err() {
            return Err(ServiceError::Validation(
                "current password is incorrect".to_string(),
            ));
        }
        if current_password == new_password {
            return Err(ServiceError::Validation(
                "new password must differ from the current password".to_string(),
            ));
        }
        self.settings.password_policy.validate(new_password)?;

        user.password_hash = self.hash(new_password)?;
        let event = self.event("user.password_changed", user.id, json!({ "user_id": user.id }))?;
        self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %user.id, "Password changed");
        Ok(())
    }

    /// Starts a reset. Succeeds whether or not the email is known.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        let Some(user) = self
            .store
            .find_user_by_email(&email)
            .await?
            .filter(|u| u.deleted_at.is_none())
        else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };

        let Some(token) = self.issue_single_use(TokenPurpose::PasswordReset, user.id).await else {
            return Ok(());
        };

        if let Err(e) = self
            .email
            .send_password_reset_email(&user.email, &token, &self.settings.public_base_url)
            .await
        {
            tracing::error!(user_id = %user.id, error = %e, "Failed to send password reset email");
        }

        tracing::info!(user_id = %user.id, "Password reset requested");
        Ok(())
    }

    /// Consumes a reset token. The password is checked against the policy
    /// before the token is taken, so a weak password leaves it usable.
    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<(), ServiceError> {
        self.settings.password_policy.validate(new_password)?;

        let user_id = self
            .consume_single_use(TokenPurpose::PasswordReset, token)
            .await?
            .ok_or(ServiceError::InvalidResetToken)?;

        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .filter(|u| u.deleted_at.is_none())
            .ok_or(ServiceError::InvalidResetToken)?;

        user.password_hash = self.hash(new_password)?;
        let event = self.event("user.password_reset", user.id, json!({ "user_id": user.id }))?;
        self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %user.id, "Password reset completed");
        Ok(())
    }

    /// Consumes a verification token and stamps the address as verified.
    /// Only an account still waiting on verification is activated; an
    /// account an admin deactivated stays inactive.
    pub async fn verify_email(&self, token: &str) -> Result<UserResponse, ServiceError> {
        let user_id = self
            .consume_single_use(TokenPurpose::EmailVerification, token)
            .await?
            .ok_or(ServiceError::InvalidVerificationToken)?;

        let mut user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .filter(|u| u.deleted_at.is_none())
            .ok_or(ServiceError::InvalidVerificationToken)?;

        if user.is_verified() {
            return Ok(user.sanitized());
        }

        if self.settings.require_email_verification && !user.is_deactivated() {
            user.is_active = true;
        }
        user.email_verified_at = Some(Utc::now());
        let event = self.event(
            "user.email_verified",
            user.id,
            json!({ "user_id": user.id, "email": user.email }),
        )?;
        let user = self.store.update_user(&user, &[event]).await?;

        tracing::info!(user_id = %user.id, "Email verified");
        Ok(user.sanitized())
    }

    /// Sends a fresh verification mail to unverified accounts that were not
    /// deactivated. Succeeds whether or not the email is known.
    pub async fn resend_verification(&self, email: &str) -> Result<(), ServiceError> {
        let email = normalize_email(email);
        match self.store.find_user_by_email(&email).await? {
            Some(user)
                if user.deleted_at.is_none() && !user.is_deactivated() && !user.is_verified() =>
            {
                self.send_verification(&user).await;
            }
            _ => tracing::debug!("Verification resend skipped"),
        }
        Ok(())
    }

    async fn send_verification(&self, user: &User) {
        let Some(token) = self
            .issue_single_use(TokenPurpose::EmailVerification, user.id)
            .await
        else {
            return;
        };

        if let Err(e) = self
            .email
            .send_verification_email(&user.email, &token, &self.settings.public_base_url)
            .await
        {
            tracing::error!(user_id = %user.id, error = %e, "Failed to send verification email");
        }
    }

    /// Stores a new single-use token; `None` when the cache write failed.
    async fn issue_single_use(&self, purpose: TokenPurpose, user_id: Uuid) -> Option<String> {
        let token = generate_random_token();
        match self
            .cache
            .set(
                &purpose.cache_key(&token),
                &user_id.to_string(),
                purpose.ttl_seconds(),
            )
            .await
        {
            Ok(()) => Some(token),
            Err(e) => {
                tracing::error!(user_id = %user_id, purpose = %purpose, error = %e, "Failed to store single-use token");
                None
            }
        }
    }

    async fn consume_single_use(
        &self,
        purpose: TokenPurpose,
        token: &str,
    ) -> Result<Option<Uuid>, ServiceError> {
        let value = self.cache.take(&purpose.cache_key(token)).await?;
        Ok(value.and_then(|v| Uuid::parse_str(&v).ok()))
    }

    /// Denylists a still-valid token until it expires. Returns its subject.
    async fn denylist(&self, token: &str) -> Result<Option<String>, ServiceError> {
        let Ok(claims) = self.jwt.validate(token) else {
            return Ok(None);
        };
        let remaining = self.jwt.remaining_lifetime(&claims);
        if remaining > 0 {
            self.cache
                .set(&denylist_key(token), "1", remaining as u64)
                .await?;
        }
        Ok(Some(claims.sub))
    }

    async fn revoked_for_user(&self, claims: &Claims, user_id: Uuid) -> Result<bool, ServiceError> {
        let marker = self.cache.get(&user_revocation_key(user_id)).await?;
        Ok(marker
            .and_then(|m| m.parse::<i64>().ok())
            .is_some_and(|revoked_at_ms| claims.issued_at_millis() <= revoked_at_ms))
    }

    async fn active_user(&self, user_id: Uuid) -> Result<User, ServiceError> {
        self.store
            .find_user_by_id(user_id)
            .await?
            .filter(User::can_authenticate)
            .ok_or(ServiceError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::InMemoryCache;
    use crate::services::email::{EmailKind, MockEmailService};
    use crate::services::memory::MemoryStore;
    use crate::services::outbox::OutboxStore;
    use crate::services::policy::PasswordPolicy;
    use crate::services::users::UserService;
    use crate::config::JwtConfig;
    use crate::models::UserState;

    struct Harness {
        auth: AuthService,
        store: Arc<MemoryStore>,
        cache: Arc<InMemoryCache>,
        mail: MockEmailService,
    }

    fn harness_with(require_verification: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let mail = MockEmailService::new();
        let jwt = JwtService::new(&JwtConfig {
            secret: "test-secret-that-is-at-least-32-bytes-long".to_string(),
            issuer: "identity-service".to_string(),
            audience: "identity-api".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            leeway_seconds: 0,
        })
        .unwrap();
        let auth = AuthService::new(
            store.clone(),
            cache.clone(),
            Arc::new(mail.clone()),
            jwt,
            AuthSettings {
                password_policy: PasswordPolicy::Standard,
                require_email_verification: require_verification,
                public_base_url: "http://localhost:8080".to_string(),
            },
            3,
        );
        Harness {
            auth,
            store,
            cache,
            mail,
        }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn register_req(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            name: "Alice".to_string(),
            phone: None,
            password: "Password123".to_string(),
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_writes_user_and_event_together() {
        let h = harness();
        let resp = h.auth.register(register_req("Alice@Ex.com")).await.unwrap();

        assert_eq!(resp.user.email, "alice@ex.com");
        let rows = h
            .store
            .find_by_aggregate(&resp.user.id.to_string())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "user.created");
        assert!(h
            .mail
            .last_token("alice@ex.com", EmailKind::Verification)
            .is_some());

        let dup = h.auth.register(register_req("ALICE@ex.com")).await;
        assert!(matches!(dup, Err(ServiceError::EmailAlreadyRegistered)));
    }

    #[tokio::test]
    async fn test_register_rejects_weak_password() {
        let h = harness();
        let mut req = register_req("a@ex.com");
        req.password = "alllowercase1".to_string();
        assert!(matches!(
            h.auth.register(req).await,
            Err(ServiceError::WeakPassword(_))
        ));
    }

    #[tokio::test]
    async fn test_register_survives_mail_failure() {
        let h = harness();
        h.mail.set_failing(true);
        assert!(h.auth.register(register_req("a@ex.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let h = harness();
        h.auth.register(register_req("a@ex.com")).await.unwrap();

        let missing = h.auth.login(login_req("nobody@ex.com", "Password123")).await;
        let wrong = h.auth.login(login_req("a@ex.com", "Wrong1234")).await;
        let (Err(missing), Err(wrong)) = (missing, wrong) else {
            panic!("expected both logins to fail");
        };
        assert_eq!(missing.to_string(), wrong.to_string());
        assert!(matches!(missing, ServiceError::InvalidCredentials));

        assert!(h.auth.login(login_req("A@EX.COM", "Password123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unverified_user_cannot_login_until_verified() {
        let h = harness_with(true);
        h.auth.register(register_req("a@ex.com")).await.unwrap();

        assert!(matches!(
            h.auth.login(login_req("a@ex.com", "Password123")).await,
            Err(ServiceError::InvalidCredentials)
        ));

        let token = h
            .mail
            .last_token("a@ex.com", EmailKind::Verification)
            .unwrap();
        let user = h.auth.verify_email(&token).await.unwrap();
        assert!(user.is_active);
        assert!(user.email_verified);

        assert!(h.auth.login(login_req("a@ex.com", "Password123")).await.is_ok());
        assert!(matches!(
            h.auth.verify_email(&token).await,
            Err(ServiceError::InvalidVerificationToken)
        ));
    }

    #[tokio::test]
    async fn test_validate_and_logout() {
        let h = harness();
        let tokens = h.auth.register(register_req("a@ex.com")).await.unwrap().tokens;

        let (user, _) = h.auth.validate_token(&tokens.access_token).await.unwrap();
        assert_eq!(user.email, "a@ex.com");

        // refresh tokens are not accepted as access tokens
        assert!(h.auth.validate_token(&tokens.refresh_token).await.is_err());

        h.auth
            .logout(&tokens.access_token, Some(&tokens.refresh_token))
            .await
            .unwrap();
        assert!(h.cache.exists(&denylist_key(&tokens.access_token)).await.unwrap());
        assert!(matches!(
            h.auth.validate_token(&tokens.access_token).await,
            Err(ServiceError::InvalidToken)
        ));
        assert!(matches!(
            h.auth.refresh(&tokens.refresh_token).await,
            Err(ServiceError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_logout_with_garbage_token_is_noop() {
        let h = harness();
        h.auth.logout("not-a-jwt", None).await.unwrap();
        assert!(!h.cache.exists(&denylist_key("not-a-jwt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_and_expiry() {
        let h = harness();
        let tokens = h.auth.register(register_req("a@ex.com")).await.unwrap().tokens;

        let refreshed = h.auth.refresh(&tokens.refresh_token).await.unwrap();
        assert_eq!(refreshed.refresh_token, tokens.refresh_token);
        assert_eq!(refreshed.refresh_expires_at, tokens.refresh_expires_at);
        assert!(h.auth.validate_token(&refreshed.access_token).await.is_ok());

        assert!(h.auth.refresh(&tokens.access_token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_all_revokes_earlier_tokens() {
        let h = harness();
        let resp = h.auth.register(register_req("a@ex.com")).await.unwrap();
        let tokens = resp.tokens;

        h.auth
            .logout_all(resp.user.id, &tokens.access_token)
            .await
            .unwrap();

        assert!(h.auth.validate_token(&tokens.access_token).await.is_err());
        assert!(h.auth.refresh(&tokens.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_login_right_after_logout_all_is_usable() {
        let h = harness();
        let resp = h.auth.register(register_req("a@ex.com")).await.unwrap();
        let other = h.auth.login(login_req("a@ex.com", "Password123")).await.unwrap();

        h.auth
            .logout_all(resp.user.id, &resp.tokens.access_token)
            .await
            .unwrap();
        let fresh = h.auth.login(login_req("a@ex.com", "Password123")).await.unwrap();

        assert!(h.auth.validate_token(&fresh.tokens.access_token).await.is_ok());
        assert!(h.auth.refresh(&fresh.tokens.refresh_token).await.is_ok());
        // the sibling session was never presented but is still revoked
        assert!(h.auth.validate_token(&other.tokens.access_token).await.is_err());
        assert!(h.auth.refresh(&other.tokens.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_inactive_user_token_rejected() {
        let h = harness();
        let resp = h.auth.register(register_req("a@ex.com")).await.unwrap();

        let mut user = h.store.find_user_by_id(resp.user.id).await.unwrap().unwrap();
        user.is_active = false;
        h.store.update_user(&user, &[]).await.unwrap();

        assert!(h.auth.validate_token(&resp.tokens.access_token).await.is_err());
        assert!(h.auth.refresh(&resp.tokens.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_password_reset_single_use() {
        let h = harness();
        h.auth.register(register_req("a@ex.com")).await.unwrap();

        h.auth.request_password_reset("a@ex.com").await.unwrap();
        let token = h
            .mail
            .last_token("a@ex.com", EmailKind::PasswordReset)
            .unwrap();
        assert_eq!(token.len(), 64);

        // weak password does not burn the token
        assert!(matches!(
            h.auth.confirm_password_reset(&token, "weak").await,
            Err(ServiceError::WeakPassword(_))
        ));

        h.auth
            .confirm_password_reset(&token, "NewPassword456")
            .await
            .unwrap();
        assert!(matches!(
            h.auth.confirm_password_reset(&token, "NewPassword789").await,
            Err(ServiceError::InvalidResetToken)
        ));

        assert!(h.auth.login(login_req("a@ex.com", "NewPassword456")).await.is_ok());
        assert!(h.auth.login(login_req("a@ex.com", "Password123")).await.is_err());
    }

    #[tokio::test]
    async fn test_password_reset_unknown_email_is_silent() {
        let h = harness();
        h.auth.request_password_reset("ghost@ex.com").await.unwrap();
        assert!(h.mail.sent().is_empty());

        h.auth.register(register_req("a@ex.com")).await.unwrap();
        h.mail.set_failing(true);
        assert!(h.auth.request_password_reset("a@ex.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_reset_confirm_has_one_winner() {
        let h = harness();
        h.auth.register(register_req("a@ex.com")).await.unwrap();
        h.auth.request_password_reset("a@ex.com").await.unwrap();
        let token = h
            .mail
            .last_token("a@ex.com", EmailKind::PasswordReset)
            .unwrap();

        let a = {
            let auth = h.auth.clone();
            let token = token.clone();
            tokio::spawn(async move { auth.confirm_password_reset(&token, "NewPassword456").await })
        };
        let b = {
            let auth = h.auth.clone();
            let token = token.clone();
            tokio::spawn(async move { auth.confirm_password_reset(&token, "NewPassword789").await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ServiceError::InvalidResetToken))));
    }

    #[tokio::test]
    async fn test_change_password() {
        let h = harness();
        let resp = h.auth.register(register_req("a@ex.com")).await.unwrap();
        let id = resp.user.id;

        assert!(matches!(
            h.auth.change_password(id, "Wrong1234", "NewPassword456").await,
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            h.auth.change_password(id, "Password123", "Password123").await,
            Err(ServiceError::Validation(_))
        ));

        h.auth
            .change_password(id, "Password123", "NewPassword456")
            .await
            .unwrap();
        assert!(h.auth.login(login_req("a@ex.com", "NewPassword456")).await.is_ok());

        let events: Vec<_> = h
            .store
            .find_by_aggregate(&id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event_type)
            .collect();
        assert!(events.contains(&"user.password_changed".to_string()));
    }

    #[tokio::test]
    async fn test_resend_only_for_unverified() {
        let h = harness();
        h.auth.register(register_req("a@ex.com")).await.unwrap();
        let first = h.mail.sent().len();

        h.auth.resend_verification("a@ex.com").await.unwrap();
        assert_eq!(h.mail.sent().len(), first + 1);

        let token = h
            .mail
            .last_token("a@ex.com", EmailKind::Verification)
            .unwrap();
        h.auth.verify_email(&token).await.unwrap();

        h.auth.resend_verification("a@ex.com").await.unwrap();
        h.auth.resend_verification("ghost@ex.com").await.unwrap();
        assert_eq!(h.mail.sent().len(), first + 1);
    }

    #[tokio::test]
    async fn test_admin_deactivation_survives_email_verification() {
        for require_verification in [false, true] {
            let h = harness_with(require_verification);
            let id = h.auth.register(register_req("a@ex.com")).await.unwrap().user.id;
            let token = h
                .mail
                .last_token("a@ex.com", EmailKind::Verification)
                .unwrap();

            let users = UserService::new(h.store.clone(), PasswordPolicy::Standard, 3);
            users.deactivate(id).await.unwrap();
            let sent = h.mail.sent().len();

            h.auth.resend_verification("a@ex.com").await.unwrap();
            assert_eq!(h.mail.sent().len(), sent);

            let user = h.auth.verify_email(&token).await.unwrap();
            assert!(user.email_verified);
            assert!(!user.is_active);
            assert_eq!(user.state, UserState::Inactive);
            assert!(h.auth.login(login_req("a@ex.com", "Password123")).await.is_err());

            users.activate(id).await.unwrap();
            assert!(h.auth.login(login_req("a@ex.com", "Password123")).await.is_ok());
        }
    }
}
