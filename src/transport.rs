use crate::types::{SendingIdentity, SmtpCredentials};
use anyhow::{Context, Result, bail};
use email_address::EmailAddress;
use lettre::message::header::{HeaderName, HeaderValue};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::info;

const IMPLICIT_TLS_PORT: u16 = 465;

// ============================================================================
// Transport traits
// ============================================================================

/// A mail-submission session bound to one sending identity.
///
/// Extra headers are passed as `(name, value)` string pairs so that
/// implementations are not coupled to SMTP client types.
#[allow(async_fn_in_trait)]
pub trait Mailer: Send + Sync {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        extra_headers: &[(&'static str, &str)],
    ) -> Result<()>;
}

/// Opens mailers for sending identities and checks raw credentials.
#[allow(async_fn_in_trait)]
pub trait Transport: Send + Sync {
    type Mailer: Mailer;

    /// Build a mailer for `identity`. Must not perform network I/O.
    fn connect(&self, identity: &SendingIdentity, pool_size: usize) -> Result<Self::Mailer>;

    /// Handshake-only verification: connect, negotiate TLS and authenticate.
    async fn verify(&self, credentials: &SmtpCredentials, timeout: Duration) -> Result<()>;
}

// ============================================================================
// SmtpTransport — lettre implementation
// ============================================================================

pub struct SmtpTransport {
    timeout: Duration,
}

impl SmtpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn build_transport(
    credentials: &SmtpCredentials,
    timeout: Duration,
    pool_size: usize,
) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let host = credentials.host.trim();
    let port = credentials.port();
    // Whitespace sneaks into app passwords copied from provider dashboards.
    let secret: String = credentials
        .secret
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let builder = if port == IMPLICIT_TLS_PORT {
        AsyncSmtpTransport::<Tokio1Executor>::relay(host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
    }
    .with_context(|| format!("Invalid SMTP host '{}'", host))?;

    let pool = lettre::transport::smtp::PoolConfig::new().max_size(pool_size.max(1) as u32);

    Ok(builder
        .port(port)
        .credentials(Credentials::new(credentials.user.trim().to_string(), secret))
        .timeout(Some(timeout))
        .pool_config(pool)
        .build())
}

impl Transport for SmtpTransport {
    type Mailer = SmtpMailer;

    fn connect(&self, identity: &SendingIdentity, pool_size: usize) -> Result<SmtpMailer> {
        let from: Mailbox = identity
            .email
            .parse()
            .with_context(|| format!("Invalid sender address '{}'", identity.email))?;
        let transport = build_transport(&identity.smtp, self.timeout, pool_size)?;
        Ok(SmtpMailer { transport, from })
    }

    async fn verify(&self, credentials: &SmtpCredentials, timeout: Duration) -> Result<()> {
        let transport = build_transport(credentials, timeout, 1)?;
        let connected = tokio::time::timeout(timeout, transport.test_connection())
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {}s", timeout.as_secs()))??;
        if !connected {
            bail!("server did not accept the connection");
        }
        Ok(())
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl Mailer for SmtpMailer {
    async fn send_email(
        &self,
        recipient: &EmailAddress,
        subject: &str,
        html_content: &str,
        text_content: &str,
        extra_headers: &[(&'static str, &str)],
    ) -> Result<()> {
        let to: Mailbox = recipient
            .to_string()
            .parse()
            .with_context(|| format!("Invalid recipient address '{}'", recipient))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject);
        for (name, value) in extra_headers {
            builder = builder.raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str(*name),
                value.to_string(),
            ));
        }
        let message = builder
            .multipart(MultiPart::alternative_plain_html(
                text_content.to_string(),
                html_content.to_string(),
            ))
            .context("Failed to build message")?;

        let response = self
            .transport
            .send(message)
            .await
            .with_context(|| format!("Failed to send email to {}", recipient))?;

        info!(
            code = %response.code(),
            recipient = %recipient,
            "Email sent"
        );

        Ok(())
    }
}

// ============================================================================
// Test utilities
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    fn creds(host: &str, port: Option<u16>) -> SmtpCredentials {
        SmtpCredentials {
            host: host.to_string(),
            port,
            user: "user@example.com".to_string(),
            secret: "abcd efgh".to_string(),
        }
    }

    #[test]
    fn connect_rejects_invalid_sender_address() {
        let identity = SendingIdentity {
            id: "acc".to_string(),
            tenant_id: "t1".to_string(),
            email: "not an address".to_string(),
            smtp: creds("smtp.example.com", None),
            daily_limit: None,
        };
        let transport = SmtpTransport::new(Duration::from_secs(5));
        assert!(transport.connect(&identity, 1).is_err());
    }
}
