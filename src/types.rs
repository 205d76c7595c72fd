use crate::lifecycle::CampaignStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_SMTP_PORT: u16 = 587;

/// A tenant-owned, multi-step outbound sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub steps: Vec<Step>,
    pub account_id: Option<String>,
    pub list_id: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    /// Run that last claimed the campaign for a batch.
    pub run_id: Option<String>,
    /// While in the future, the run in `run_id` owns the campaign.
    pub lease_until: Option<DateTime<Utc>>,
    /// Every step has gone out; the follow-up scheduler no longer polls it.
    #[serde(default)]
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub subject: String,
    pub body: String,
    /// Days to wait after the previous step went out. Ignored for the first step.
    #[serde(default)]
    pub delay: u32,
}

impl Step {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, delay: u32) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            delay,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpCredentials {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub secret: String,
}

impl SmtpCredentials {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SMTP_PORT)
    }

    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && !self.user.trim().is_empty()
            && !self.secret.trim().is_empty()
    }
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The account a campaign sends from. Read-only to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingIdentity {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub smtp: SmtpCredentials,
    pub daily_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub name: Option<String>,
    pub company: Option<String>,
}

impl Recipient {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            ..Default::default()
        }
    }
}

/// Normalize an address for suppression lookups.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A recorded opt-out. PK="SUPPRESSION#{tenant}", SK="{email}"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub tenant_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(tenant_id: &str, email: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            email: normalize_email(email),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendOutcome {
    Sent,
    Bounced,
}

impl FromStr for SendOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "bounced" => Ok(Self::Bounced),
            other => anyhow::bail!("Invalid send outcome: {}", other),
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Bounced => write!(f, "bounced"),
        }
    }
}

impl Serialize for SendOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SendOutcome {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SendOutcome::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Durable proof of one delivery attempt.
/// PK="SENDS#{campaign_id}", SK="{step_index}#{recipient_id}"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRecord {
    pub campaign_id: String,
    pub tenant_id: String,
    pub recipient_id: String,
    pub email: String,
    pub step_index: usize,
    pub outcome: SendOutcome,
    pub attempted_at: DateTime<Utc>,
    pub run_id: String,
    pub error: Option<String>,
}

impl SendRecord {
    pub fn is_sent(&self) -> bool {
        self.outcome == SendOutcome::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_default_port_is_submission() {
        let creds = SmtpCredentials {
            host: "smtp.example.com".to_string(),
            port: None,
            user: "me".to_string(),
            secret: "pw".to_string(),
        };
        assert_eq!(creds.port(), 587);
        assert!(creds.is_complete());
    }

    #[test]
    fn credentials_missing_secret_is_incomplete() {
        let creds = SmtpCredentials {
            host: "smtp.example.com".to_string(),
            port: Some(465),
            user: "me".to_string(),
            secret: String::new(),
        };
        assert!(!creds.is_complete());
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let creds = SmtpCredentials {
            host: "h".to_string(),
            port: None,
            user: "u".to_string(),
            secret: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn suppression_entry_normalizes_email() {
        let entry = SuppressionEntry::new("t1", "  Jane@Co.COM ");
        assert_eq!(entry.email, "jane@co.com");
    }

    #[test]
    fn send_outcome_parses_display_form() {
        assert_eq!("sent".parse::<SendOutcome>().unwrap(), SendOutcome::Sent);
        assert_eq!(SendOutcome::Bounced.to_string(), "bounced");
        assert!("delivered".parse::<SendOutcome>().is_err());
    }
}
