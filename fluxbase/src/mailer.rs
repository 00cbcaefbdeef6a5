//! Outbound email
//!
//! Delivery itself is a collaborator; flows depend on the [`Mailer`]
//! capability only. The SMTP implementation covers production, the
//! logging implementation covers deployments without SMTP, and the
//! capturing implementation lets tests read issued codes back.

use async_trait::async_trait;
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Mutex;

use crate::config::EmailConfig;
use crate::error::{Error, Result};

/// Email delivery capability
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// SMTP delivery via lettre
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|_| Error::Config("email.from_address is not a valid mailbox".into()))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| Error::Config(format!("invalid SMTP relay: {}", e)))?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to
                .parse()
                .map_err(|_| Error::BadRequest("invalid recipient address".into()))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| Error::Internal(format!("failed to build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| Error::External(format!("SMTP delivery failed: {}", e)))?;

        Ok(())
    }
}

/// Logs instead of sending; used when email is disabled
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        tracing::info!(%to, %subject, "email delivery disabled, message logged");
        Ok(())
    }
}

/// Captures messages for tests
#[derive(Default)]
pub struct CapturingMailer {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

impl CapturingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last message sent to an address
    pub fn last_to(&self, to: &str) -> Option<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(recipient, _, _)| recipient == to)
            .map(|(_, subject, body)| (subject.clone(), body.clone()))
    }
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capturing_mailer() {
        let mailer = CapturingMailer::new();
        mailer.send("a@b.co", "Your code", "123456").await.unwrap();
        mailer.send("a@b.co", "Again", "654321").await.unwrap();

        let (subject, body) = mailer.last_to("a@b.co").unwrap();
        assert_eq!(subject, "Again");
        assert_eq!(body, "654321");
        assert!(mailer.last_to("x@y.z").is_none());
    }

    #[tokio::test]
    async fn test_log_mailer_accepts_anything() {
        assert!(LogMailer.send("a@b.co", "s", "b").await.is_ok());
    }
}
