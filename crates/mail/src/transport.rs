//! Mail delivery via SMTP.
//!
//! [`MailTransport`] is the seam the orchestrator sends through;
//! [`SmtpMailer`] wraps the `lettre` async SMTP transport.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;

use crate::error::MailError;

/// Default SMTP port (plain SMTP to a local relay).
const DEFAULT_SMTP_PORT: u16 = 25;

fn default_port() -> u16 {
    DEFAULT_SMTP_PORT
}

/// Configuration of the SMTP relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upgrade the connection with STARTTLS.
    #[serde(default)]
    pub starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMTP_HOST` is not set.
    ///
    /// | Variable        | Required | Default |
    /// |-----------------|----------|---------|
    /// | `SMTP_HOST`     | yes      |         |
    /// | `SMTP_PORT`     | no       | `25`    |
    /// | `SMTP_STARTTLS` | no       | `false` |
    /// | `SMTP_USER`     | no       |         |
    /// | `SMTP_PASSWORD` | no       |         |
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;
        Some(Self {
            host,
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            starttls: std::env::var("SMTP_STARTTLS").is_ok_and(|v| v == "1" || v == "true"),
            username: std::env::var("SMTP_USER").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send `message`. With `envelope_recipients` the message goes to those
    /// addresses instead of the ones in its headers.
    async fn send(
        &self,
        message: &Message,
        envelope_recipients: Option<&[String]>,
    ) -> Result<(), MailError>;
}

/// The SMTP envelope for `message`, optionally overriding the recipients.
pub fn envelope_for(
    message: &Message,
    envelope_recipients: Option<&[String]>,
) -> Result<Envelope, MailError> {
    let default = message.envelope();
    match envelope_recipients {
        None => Ok(default.clone()),
        Some(recipients) => {
            let to = recipients
                .iter()
                .map(|r| r.parse::<Address>())
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Envelope::new(default.from().cloned(), to)?)
        }
    }
}

/// Sends through one SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(
        &self,
        message: &Message,
        envelope_recipients: Option<&[String]>,
    ) -> Result<(), MailError> {
        let envelope = envelope_for(message, envelope_recipients)?;
        self.transport
            .send_raw(&envelope, &message.formatted())
            .await?;
        tracing::debug!(to = ?envelope.to(), "Mail handed to SMTP relay");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dry runs
// ---------------------------------------------------------------------------

/// Accepts every message without sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardTransport;

#[async_trait]
impl MailTransport for DiscardTransport {
    async fn send(
        &self,
        message: &Message,
        envelope_recipients: Option<&[String]>,
    ) -> Result<(), MailError> {
        let envelope = envelope_for(message, envelope_recipients)?;
        tracing::info!(to = ?envelope.to(), "Dry run, mail not sent");
        Ok(())
    }
}

/// Writes every message to `out` instead of sending it.
pub struct PreviewTransport<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> PreviewTransport<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> MailTransport for PreviewTransport<W> {
    async fn send(
        &self,
        message: &Message,
        envelope_recipients: Option<&[String]>,
    ) -> Result<(), MailError> {
        let envelope = envelope_for(message, envelope_recipients)?;
        let recipients: Vec<String> = envelope.to().iter().map(ToString::to_string).collect();
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "Envelope-To: {}", recipients.join(", "))?;
        out.write_all(&message.formatted())?;
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
