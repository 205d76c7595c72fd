//! Single delivery attempt with outcome classification.

use crate::renderer::RenderedMessage;
use crate::transport::Mailer;
use crate::types::SendOutcome;
use email_address::EmailAddress;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Any transport failure: bad address, connection, auth, rejection, timeout.
    Bounced { reason: String },
}

impl DeliveryOutcome {
    pub fn as_send_outcome(&self) -> SendOutcome {
        match self {
            Self::Sent => SendOutcome::Sent,
            Self::Bounced { .. } => SendOutcome::Bounced,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Sent => None,
            Self::Bounced { reason } => Some(reason),
        }
    }
}

/// Make exactly one transmission attempt. Never retries and never fails:
/// every error is folded into `Bounced`.
pub async fn deliver<M: Mailer>(
    mailer: &M,
    recipient_email: &str,
    message: &RenderedMessage,
    timeout: Duration,
) -> DeliveryOutcome {
    let recipient = match EmailAddress::from_str(recipient_email.trim()) {
        Ok(address) => address,
        Err(e) => {
            warn!(recipient = %recipient_email, error = %e, "Invalid recipient address");
            return DeliveryOutcome::Bounced {
                reason: format!("Invalid recipient address: {}", e),
            };
        }
    };

    // RFC 8058 one-click unsubscribe
    let list_unsubscribe = format!("<{}>", message.unsubscribe_url);
    let headers: &[(&'static str, &str)] = &[
        ("List-Unsubscribe", &list_unsubscribe),
        ("List-Unsubscribe-Post", "List-Unsubscribe=One-Click"),
    ];

    let attempt = mailer.send_email(
        &recipient,
        &message.subject,
        &message.html,
        &message.text,
        headers,
    );

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(())) => DeliveryOutcome::Sent,
        Ok(Err(e)) => {
            warn!(recipient = %recipient, error = %e, "Delivery failed");
            DeliveryOutcome::Bounced {
                reason: format!("{:#}", e),
            }
        }
        Err(_) => {
            warn!(recipient = %recipient, timeout_secs = timeout.as_secs(), "Delivery timed out");
            DeliveryOutcome::Bounced {
                reason: format!("Timed out after {}s", timeout.as_secs()),
            }
        }
    }
}
