//! Periodic follow-up pass: offer every waiting campaign to the engine and
//! let it decide whether a step is due.

use crate::dispatch::{DispatchEngine, DispatchOutcome};
use crate::error::{DispatchError, PreconditionError};
use crate::lifecycle::CampaignStatus;
use crate::storage::Storage;
use crate::transport::Transport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{Instrument, error, info, info_span, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    pub batches: usize,
    pub emails_sent: usize,
    pub deferred: usize,
    pub waiting: usize,
    pub exhausted: usize,
    /// Campaigns another run was still sending.
    pub in_progress: usize,
    pub failed: usize,
}

/// Dispatch every campaign in an awaiting-follow-up status, one at a time.
/// A failing campaign is logged and counted; it never stops the pass.
pub async fn run_due_campaigns<S, T>(
    engine: &DispatchEngine<S, T>,
    now: DateTime<Utc>,
) -> Result<SchedulerReport>
where
    S: Storage,
    T: Transport,
{
    let mut campaigns = Vec::new();
    for status in CampaignStatus::awaiting_followup() {
        let found = engine
            .storage()
            .get_pending_campaigns(*status)
            .await
            .with_context(|| format!("Failed to list {} campaigns", status))?;
        campaigns.extend(found);
    }

    info!(campaigns = campaigns.len(), "Checking campaigns for due steps");

    let mut report = SchedulerReport::default();
    for campaign in campaigns {
        let span = info_span!("campaign", id = %campaign.id, tenant_id = %campaign.tenant_id);
        let outcome = engine
            .dispatch_at(&campaign.id, &campaign.tenant_id, now)
            .instrument(span)
            .await;

        match outcome {
            Ok(DispatchOutcome::Batch(result)) => {
                report.batches += 1;
                report.emails_sent += result.sent;
            }
            Ok(DispatchOutcome::Scheduled { .. }) => report.deferred += 1,
            Ok(DispatchOutcome::Waiting { .. }) => report.waiting += 1,
            Ok(DispatchOutcome::Exhausted) => report.exhausted += 1,
            Err(DispatchError::Precondition(PreconditionError::BatchInProgress)) => {
                info!(campaign_id = %campaign.id, "Campaign busy, leaving it to the running batch");
                report.in_progress += 1;
            }
            Err(DispatchError::Precondition(e)) => {
                warn!(campaign_id = %campaign.id, error = %e, "Campaign skipped");
                report.failed += 1;
            }
            Err(e) => {
                error!(campaign_id = %campaign.id, error = %e, "Campaign dispatch failed");
                report.failed += 1;
            }
        }
    }

    info!(
        batches = report.batches,
        emails_sent = report.emails_sent,
        in_progress = report.in_progress,
        failed = report.failed,
        "Follow-up pass finished"
    );
    Ok(report)
}
