use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use service_core::axum::async_trait;
use service_core::error::AppError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SmtpConfig;

pub fn verification_link(base_url: &str, token: &str) -> String {
    format!("{}/api/v1/auth/verify-email?token={}", base_url, token)
}

pub fn password_reset_link(base_url: &str, token: &str) -> String {
    format!("{}/api/v1/auth/confirm-reset?token={}", base_url, token)
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError>;

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        base_url: &str,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, AppError> {
        let host = config.host.as_deref().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("SMTP_HOST is required for SMTP delivery"))
        })?;

        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let mailer = SmtpTransport::starttls_relay(host)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e.to_string())))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %host, port = config.port, "Email service initialized with SMTP relay");

        Ok(Self {
            mailer,
            from_email: config.from_address.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), AppError> {
        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?,
            )
            .to(to_email
                .parse()
                .map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )?;

        // SmtpTransport is blocking
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, subject = %subject, "Failed to send email");
                Err(AppError::EmailError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        let link = verification_link(base_url, verification_token);

        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Welcome! Please verify your email</h2>
        <p>Thank you for registering. Please click the link below to verify your email address:</p>
        <p><a href="{link}">Verify Email</a></p>
        <p style="color: #666; font-size: 12px;">
            This link will expire in 24 hours. If you didn't request this, please ignore this email.
        </p>
    </body>
</html>"###
        );

        let plain_body = format!(
            "Welcome! Please verify your email\n\n\
             Thank you for registering. Please visit the following link to verify your email address:\n\n\
             {link}\n\n\
             This link will expire in 24 hours. If you didn't request this, please ignore this email."
        );

        self.send_email(
            to_email,
            "Verify Your Email Address",
            &plain_body,
            &html_body,
        )
        .await
    }

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        let link = password_reset_link(base_url, reset_token);

        let html_body = format!(
            r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Password Reset Request</h2>
        <p>We received a request to reset your password. Click the link below to set a new password:</p>
        <p><a href="{link}">Reset Password</a></p>
        <p style="color: #666; font-size: 12px;">
            This link will expire in 1 hour. If you didn't request this, please ignore this email.
        </p>
    </body>
</html>"###
        );

        let plain_body = format!(
            "Password Reset Request\n\n\
             We received a request to reset your password. Please visit the following link to set a new password:\n\n\
             {link}\n\n\
             This link will expire in 1 hour. If you didn't request this, please ignore this email."
        );

        self.send_email(to_email, "Reset Your Password", &plain_body, &html_body)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    Verification,
    PasswordReset,
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub kind: EmailKind,
    pub token: String,
    pub link: String,
}

/// Records outgoing mail instead of delivering it. Used in tests and when
/// no SMTP host is configured.
#[derive(Clone, Default)]
pub struct MockEmailService {
    sent: Arc<Mutex<Vec<SentEmail>>>,
    fail: Arc<AtomicBool>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Token of the most recent mail of `kind` sent to `to`.
    pub fn last_token(&self, to: &str, kind: EmailKind) -> Option<String> {
        self.sent()
            .into_iter()
            .rev()
            .find(|m| m.kind == kind && m.to.eq_ignore_ascii_case(to))
            .map(|m| m.token)
    }

    fn record(&self, to: &str, kind: EmailKind, token: &str, link: String) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::EmailError("mail transport unavailable".to_string()));
        }
        tracing::info!(kind = ?kind, "Email delivery disabled; message recorded");
        self.sent
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Mock mailbox poisoned: {}", e)))?
            .push(SentEmail {
                to: to.to_string(),
                kind,
                token: token.to_string(),
                link,
            });
        Ok(())
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_verification_email(
        &self,
        to_email: &str,
        verification_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        self.record(
            to_email,
            EmailKind::Verification,
            verification_token,
            verification_link(base_url, verification_token),
        )
    }

    async fn send_password_reset_email(
        &self,
        to_email: &str,
        reset_token: &str,
        base_url: &str,
    ) -> Result<(), AppError> {
        self.record(
            to_email,
            EmailKind::PasswordReset,
            reset_token,
            password_reset_link(base_url, reset_token),
        )
    }
}
