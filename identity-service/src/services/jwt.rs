use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::JwtConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims carried by both token types. Permissions are never embedded;
/// authorization is recomputed on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    pub email: String,
    pub typ: TokenType,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    /// Issue time in milliseconds, compared against LogoutAll markers.
    #[serde(default)]
    pub iat_ms: i64,
    pub nbf: i64,
    pub exp: i64,
    /// JWT ID, unique per token
    pub jti: String,
}

impl Claims {
    pub fn issued_at_millis(&self) -> i64 {
        if self.iat_ms > 0 {
            self.iat_ms
        } else {
            self.iat * 1000
        }
    }

    pub fn user_id(&self) -> Result<Uuid, anyhow::Error> {
        Uuid::parse_str(&self.sub).map_err(|e| anyhow::anyhow!("Invalid subject: {}", e))
    }
}

/// Token pair returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    /// Unix timestamp at which the refresh token expires
    pub refresh_expires_at: i64,
}

/// HS256 token issuer and validator.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
    leeway_seconds: u64,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        if config.secret.len() < 32 {
            return Err(anyhow::anyhow!("JWT secret must be at least 32 bytes"));
        }

        tracing::info!(issuer = %config.issuer, "JWT service initialized with HS256");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
            leeway_seconds: config.leeway_seconds,
        })
    }

    fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        typ: TokenType,
        lifetime: Duration,
    ) -> Result<(String, Claims), anyhow::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email: email.to_string(),
            typ,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            iat_ms: now.timestamp_millis(),
            nbf: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode token: {}", e))?;

        Ok((token, claims))
    }

    pub fn issue_access(&self, user_id: Uuid, email: &str) -> Result<String, anyhow::Error> {
        self.issue(
            user_id,
            email,
            TokenType::Access,
            Duration::minutes(self.access_token_expiry_minutes),
        )
        .map(|(token, _)| token)
    }

    pub fn issue_refresh(&self, user_id: Uuid, email: &str) -> Result<String, anyhow::Error> {
        self.issue(
            user_id,
            email,
            TokenType::Refresh,
            Duration::days(self.refresh_token_expiry_days),
        )
        .map(|(token, _)| token)
    }

    pub fn issue_pair(&self, user_id: Uuid, email: &str) -> Result<TokenResponse, anyhow::Error> {
        let access_token = self.issue_access(user_id, email)?;
        let (refresh_token, refresh_claims) = self.issue(
            user_id,
            email,
            TokenType::Refresh,
            Duration::days(self.refresh_token_expiry_days),
        )?;

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_token_expiry_seconds(),
            refresh_expires_at: refresh_claims.exp,
        })
    }

    /// Checks signature (HS256 only), issuer, audience, `nbf` and `exp`.
    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = self.leeway_seconds;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud", "sub"]);

        decode::<Claims>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }

    /// Mints a new access token from a valid refresh token; same subject and email.
    pub fn refresh_access(&self, refresh_token: &str) -> Result<String, anyhow::Error> {
        let claims = self
            .validate(refresh_token)
            .map_err(|e| anyhow::anyhow!("Invalid refresh token: {}", e))?;

        if claims.typ != TokenType::Refresh {
            return Err(anyhow::anyhow!("Token is not a refresh token"));
        }

        self.issue_access(claims.user_id()?, &claims.email)
    }

    /// Seconds until `exp`, clamped at zero.
    pub fn remaining_lifetime(&self, claims: &Claims) -> i64 {
        (claims.exp - Utc::now().timestamp()).max(0)
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_seconds(&self) -> i64 {
        self.refresh_token_expiry_days * 24 * 60 * 60
    }
}
