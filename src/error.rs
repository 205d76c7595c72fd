//! Error types surfaced at the dispatch and opt-out boundaries.

use crate::lifecycle::{CampaignStatus, LifecycleEvent};

/// Batch-level problems detected before any delivery is attempted.
/// Each variant is a distinct, user-facing reason.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("Campaign not found")]
    CampaignNotFound,

    #[error("Campaign is paused. Resume it before sending.")]
    CampaignPaused,

    #[error("A send is already in progress for this campaign.")]
    BatchInProgress,

    #[error("Cannot {event} a campaign that is {from}")]
    InvalidTransition {
        from: CampaignStatus,
        event: LifecycleEvent,
    },

    #[error("Sending account not found. Please assign an email account to this campaign.")]
    SendingIdentityNotFound,

    #[error(
        "SMTP credentials not configured for this account. Go to Email Accounts to set them up."
    )]
    IncompleteCredentials,

    #[error("Sending account is misconfigured: {0}")]
    InvalidSendingIdentity(String),

    #[error("No email steps defined in this campaign.")]
    NoSteps,

    #[error("No leads found in the linked lead list.")]
    NoRecipients,

    #[error("All leads in this list have unsubscribed.")]
    AllUnsubscribed,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The record-keeping store failed; the run stops rather than lose audit records.
    #[error("Persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

impl DispatchError {
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptOutError {
    #[error("Missing or invalid parameters.")]
    InvalidParameters,

    #[error("Failed to record opt-out: {0:#}")]
    Persistence(anyhow::Error),
}
