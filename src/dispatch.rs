//! Campaign dispatch engine.
//!
//! One call to [`DispatchEngine::dispatch`] checks every batch-level
//! precondition up front, resolves the due step, then runs one delivery
//! attempt per eligible recipient through a bounded, order-preserving pool.

use crate::delivery::{self, DeliveryOutcome};
use crate::error::{DispatchError, PreconditionError};
use crate::lifecycle::{CampaignStatus, LifecycleEvent};
use crate::renderer;
use crate::storage::{BatchClaim, Storage};
use crate::suppression::{Partition, SuppressionList};
use crate::transport::{Mailer, Transport};
use crate::types::{Campaign, Recipient, SendRecord, SendingIdentity, Step};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of `(email, error)` pairs kept in a [`BatchResult`].
pub const MAX_REPORTED_ERRORS: usize = 10;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Public origin used to build unsubscribe links.
    pub base_url: String,
    pub send_concurrency: usize,
    /// Minimum gap between two attempt starts, shared by all workers.
    pub min_send_interval: Duration,
    pub send_timeout: Duration,
    /// Base time a run owns its campaign; paced batches get the pacing on top.
    pub batch_lease: Duration,
}

impl DispatchSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            send_concurrency: 1,
            min_send_interval: Duration::ZERO,
            send_timeout: Duration::from_secs(30),
            batch_lease: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// `scheduled_at` lies in the future; nothing was sent.
    Scheduled { scheduled_at: DateTime<Utc> },
    /// The next follow-up exists but its delay has not elapsed.
    Waiting {
        step_index: usize,
        due_at: DateTime<Utc>,
    },
    /// Every step has already been dispatched.
    Exhausted,
    Batch(BatchResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptError {
    pub email: String,
    pub error: String,
}

/// Aggregate of one batch run. Built once, after every attempt finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub step_index: usize,
    pub run_id: String,
    pub sent: usize,
    pub bounced: usize,
    pub total: usize,
    pub skipped_unsubscribed: usize,
    pub skipped_already_sent: usize,
    pub errors: Vec<AttemptError>,
    pub status: CampaignStatus,
}

// ============================================================================
// Due step resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueStep {
    Ready(usize),
    Waiting {
        step_index: usize,
        due_at: DateTime<Utc>,
    },
    Exhausted,
}

/// The lowest step with no `sent` record anywhere in the campaign. A
/// follow-up becomes ready `delay` days after the last successful send of the
/// step before it.
pub fn resolve_due_step(steps: &[Step], records: &[SendRecord], now: DateTime<Utc>) -> DueStep {
    let last_sent = |index: usize| {
        records
            .iter()
            .filter(|r| r.step_index == index && r.is_sent())
            .map(|r| r.attempted_at)
            .max()
    };

    for (index, step) in steps.iter().enumerate() {
        if last_sent(index).is_some() {
            continue;
        }
        if index == 0 {
            return DueStep::Ready(0);
        }
        if let Some(previous) = last_sent(index - 1) {
            let due_at = previous + chrono::Duration::days(i64::from(step.delay));
            if now < due_at {
                return DueStep::Waiting {
                    step_index: index,
                    due_at,
                };
            }
        }
        return DueStep::Ready(index);
    }

    DueStep::Exhausted
}

// ============================================================================
// Throttle — shared pacing between attempt starts
// ============================================================================

struct Throttle {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last_start = Some(Instant::now());
    }
}

// ============================================================================
// DispatchEngine
// ============================================================================

struct Batch<'a, M> {
    campaign: &'a Campaign,
    step: &'a Step,
    step_index: usize,
    run_id: &'a str,
    mailer: &'a M,
    throttle: &'a Throttle,
    /// Set once a send record fails to persist; no new attempt starts after.
    aborted: AtomicBool,
}

impl<M> Batch<'_, M> {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct Attempt {
    email: String,
    outcome: DeliveryOutcome,
}

pub struct DispatchEngine<S: Storage, T: Transport> {
    storage: Arc<S>,
    transport: Arc<T>,
    settings: DispatchSettings,
}

impl<S: Storage, T: Transport> DispatchEngine<S, T> {
    pub fn new(storage: Arc<S>, transport: Arc<T>, settings: DispatchSettings) -> Self {
        Self {
            storage,
            transport,
            settings,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn dispatch(
        &self,
        campaign_id: &str,
        tenant_id: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_at(campaign_id, tenant_id, Utc::now()).await
    }

    pub async fn dispatch_at(
        &self,
        campaign_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;

        if campaign.status.is_paused() {
            return Err(PreconditionError::CampaignPaused.into());
        }

        if let Some(scheduled_at) = campaign.scheduled_at.filter(|at| *at > now) {
            self.transition(&campaign.id, campaign.status, LifecycleEvent::Defer)
                .await?;
            info!(campaign_id = %campaign.id, %scheduled_at, "Campaign deferred until scheduled time");
            return Ok(DispatchOutcome::Scheduled { scheduled_at });
        }

        let identity = self.load_identity(&campaign).await?;
        let workers = self.worker_count(&identity);
        let mailer = self
            .transport
            .connect(&identity, workers)
            .map_err(|e| PreconditionError::InvalidSendingIdentity(format!("{:#}", e)))?;

        if campaign.steps.is_empty() {
            return Err(PreconditionError::NoSteps.into());
        }

        let records = self
            .storage
            .get_send_records(&campaign.id)
            .await
            .map_err(DispatchError::persistence)?;

        let step_index = match resolve_due_step(&campaign.steps, &records, now) {
            DueStep::Ready(index) => index,
            DueStep::Waiting { step_index, due_at } => {
                info!(campaign_id = %campaign.id, step_index, %due_at, "Next step not due yet");
                return Ok(DispatchOutcome::Waiting { step_index, due_at });
            }
            DueStep::Exhausted => {
                info!(campaign_id = %campaign.id, "All steps already dispatched");
                if !campaign.exhausted {
                    if let Err(e) = self.storage.mark_exhausted(&campaign.id).await {
                        warn!(campaign_id = %campaign.id, error = %e, "Failed to mark campaign exhausted");
                    }
                }
                return Ok(DispatchOutcome::Exhausted);
            }
        };

        let recipients = self
            .storage
            .get_recipients(&campaign.list_id)
            .await
            .map_err(DispatchError::persistence)?;
        if recipients.is_empty() {
            return Err(PreconditionError::NoRecipients.into());
        }

        let suppressed = self
            .storage
            .get_suppressed_emails(&campaign.tenant_id)
            .await
            .map_err(DispatchError::persistence)?;
        let Partition { eligible, excluded } =
            SuppressionList::new(suppressed).partition(recipients);
        if eligible.is_empty() {
            return Err(PreconditionError::AllUnsubscribed.into());
        }

        let already_sent: HashSet<&str> = records
            .iter()
            .filter(|r| r.step_index == step_index && r.is_sent())
            .map(|r| r.recipient_id.as_str())
            .collect();
        let mut seen = HashSet::new();
        let mut skipped_already_sent = 0;
        let pending: Vec<Recipient> = eligible
            .into_iter()
            .filter(|r| {
                if already_sent.contains(r.id.as_str()) {
                    skipped_already_sent += 1;
                    return false;
                }
                seen.insert(r.id.clone())
            })
            .collect();

        let run_id = uuid::Uuid::new_v4().to_string();
        let status = self.claim(&campaign, &run_id, now, pending.len()).await?;

        info!(
            campaign_id = %campaign.id,
            run_id = %run_id,
            step_index,
            recipients = pending.len(),
            skipped_unsubscribed = excluded.len(),
            skipped_already_sent,
            workers,
            "Starting batch"
        );

        let throttle = Throttle::new(self.settings.min_send_interval);
        let batch = Batch {
            campaign: &campaign,
            step: &campaign.steps[step_index],
            step_index,
            run_id: &run_id,
            mailer: &mailer,
            throttle: &throttle,
            aborted: AtomicBool::new(false),
        };

        // Every started attempt runs to the end; an abort only stops new starts.
        let futures: Vec<_> = pending
            .iter()
            .map(|recipient| self.attempt(&batch, recipient))
            .collect();
        let results: Vec<Result<Option<Attempt>, DispatchError>> = stream::iter(futures)
            .buffered(workers)
            .collect()
            .await;

        let mut attempts = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(attempt)) => attempts.push(attempt),
                Ok(None) => {}
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(err) = failure {
            warn!(
                campaign_id = %campaign.id,
                run_id = %run_id,
                attempted = attempts.len(),
                recipients = pending.len(),
                "Batch aborted"
            );
            self.release_after_abort(&campaign.id, &run_id).await;
            return Err(err);
        }

        let total = attempts.len();
        let sent = attempts
            .iter()
            .filter(|a| a.outcome == DeliveryOutcome::Sent)
            .count();
        let event = LifecycleEvent::Finish { sent, total };
        let status = status
            .apply(event)
            .ok_or(PreconditionError::InvalidTransition { from: status, event })?;
        self.storage
            .release_batch(&campaign.id, &run_id, status)
            .await
            .map_err(DispatchError::persistence)?;

        let errors = attempts
            .iter()
            .filter_map(|a| {
                a.outcome.error().map(|error| AttemptError {
                    email: a.email.clone(),
                    error: error.to_string(),
                })
            })
            .take(MAX_REPORTED_ERRORS)
            .collect();

        let result = BatchResult {
            step_index,
            run_id,
            sent,
            bounced: total - sent,
            total,
            skipped_unsubscribed: excluded.len(),
            skipped_already_sent,
            errors,
            status,
        };

        info!(
            campaign_id = %campaign.id,
            run_id = %result.run_id,
            sent = result.sent,
            bounced = result.bounced,
            status = %result.status,
            "Batch finished"
        );

        Ok(DispatchOutcome::Batch(result))
    }

    pub async fn pause(
        &self,
        campaign_id: &str,
        tenant_id: &str,
    ) -> Result<CampaignStatus, DispatchError> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;
        let status = self
            .transition(&campaign.id, campaign.status, LifecycleEvent::Pause)
            .await?;
        info!(campaign_id = %campaign.id, "Campaign paused");
        Ok(status)
    }

    pub async fn resume(
        &self,
        campaign_id: &str,
        tenant_id: &str,
    ) -> Result<CampaignStatus, DispatchError> {
        let campaign = self.load_campaign(campaign_id, tenant_id).await?;
        let status = self
            .transition(&campaign.id, campaign.status, LifecycleEvent::Resume)
            .await?;
        info!(campaign_id = %campaign.id, "Campaign resumed");
        Ok(status)
    }

    async fn load_campaign(
        &self,
        campaign_id: &str,
        tenant_id: &str,
    ) -> Result<Campaign, DispatchError> {
        self.storage
            .get_campaign(campaign_id)
            .await
            .map_err(DispatchError::persistence)?
            .filter(|c| c.tenant_id == tenant_id)
            .ok_or_else(|| PreconditionError::CampaignNotFound.into())
    }

    async fn load_identity(&self, campaign: &Campaign) -> Result<SendingIdentity, DispatchError> {
        let Some(account_id) = campaign.account_id.as_deref() else {
            return Err(PreconditionError::SendingIdentityNotFound.into());
        };

        let identity = self
            .storage
            .get_sending_identity(account_id)
            .await
            .map_err(DispatchError::persistence)?
            .filter(|i| i.tenant_id == campaign.tenant_id)
            .ok_or(PreconditionError::SendingIdentityNotFound)?;

        if !identity.smtp.is_complete() {
            return Err(PreconditionError::IncompleteCredentials.into());
        }
        Ok(identity)
    }

    fn worker_count(&self, identity: &SendingIdentity) -> usize {
        let limit = identity
            .daily_limit
            .map_or(usize::MAX, |limit| limit as usize);
        self.settings.send_concurrency.min(limit).max(1)
    }

    /// Take the campaign for this run. Loses to any run that claimed it since
    /// `campaign` was loaded or still holds a live lease.
    async fn claim(
        &self,
        campaign: &Campaign,
        run_id: &str,
        now: DateTime<Utc>,
        pending: usize,
    ) -> Result<CampaignStatus, DispatchError> {
        let event = LifecycleEvent::Start;
        let next = campaign
            .status
            .apply(event)
            .ok_or(PreconditionError::InvalidTransition {
                from: campaign.status,
                event,
            })?;

        let claim = BatchClaim {
            campaign_id: &campaign.id,
            from: campaign.status,
            previous_run: campaign.run_id.as_deref(),
            run_id,
            now,
            lease_until: now + self.lease_for(pending),
        };
        let claimed = self
            .storage
            .claim_batch(&claim)
            .await
            .map_err(DispatchError::persistence)?;
        if !claimed {
            info!(campaign_id = %campaign.id, "Campaign is held by another run");
            return Err(PreconditionError::BatchInProgress.into());
        }
        Ok(next)
    }

    fn lease_for(&self, pending: usize) -> chrono::Duration {
        let pacing = self
            .settings
            .min_send_interval
            .saturating_mul(u32::try_from(pending).unwrap_or(u32::MAX));
        chrono::Duration::from_std(self.settings.batch_lease.saturating_add(pacing))
            .unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Hand the campaign back as `active` so the next run can pick up the rest.
    async fn release_after_abort(&self, campaign_id: &str, run_id: &str) {
        if let Err(e) = self
            .storage
            .release_batch(campaign_id, run_id, CampaignStatus::Active)
            .await
        {
            warn!(
                campaign_id = %campaign_id,
                run_id = %run_id,
                error = %e,
                "Failed to release batch; its lease will expire"
            );
        }
    }

    async fn transition(
        &self,
        campaign_id: &str,
        from: CampaignStatus,
        event: LifecycleEvent,
    ) -> Result<CampaignStatus, DispatchError> {
        let next = from
            .apply(event)
            .ok_or(PreconditionError::InvalidTransition { from, event })?;
        self.storage
            .set_campaign_status(campaign_id, next)
            .await
            .map_err(DispatchError::persistence)?;
        Ok(next)
    }

    async fn attempt<M: Mailer>(
        &self,
        batch: &Batch<'_, M>,
        recipient: &Recipient,
    ) -> Result<Option<Attempt>, DispatchError> {
        if batch.is_aborted() {
            return Ok(None);
        }
        batch.throttle.wait().await;
        if batch.is_aborted() {
            return Ok(None);
        }

        let message = renderer::render(
            batch.step,
            recipient,
            &batch.campaign.tenant_id,
            &self.settings.base_url,
        );
        let outcome = delivery::deliver(
            batch.mailer,
            &recipient.email,
            &message,
            self.settings.send_timeout,
        )
        .await;

        let record = SendRecord {
            campaign_id: batch.campaign.id.clone(),
            tenant_id: batch.campaign.tenant_id.clone(),
            recipient_id: recipient.id.clone(),
            email: recipient.email.clone(),
            step_index: batch.step_index,
            outcome: outcome.as_send_outcome(),
            attempted_at: Utc::now(),
            run_id: batch.run_id.to_string(),
            error: outcome.error().map(str::to_string),
        };

        if let Err(e) = self.storage.put_send_record(&record).await {
            batch.aborted.store(true, Ordering::SeqCst);
            warn!(
                campaign_id = %batch.campaign.id,
                recipient_id = %recipient.id,
                error = %e,
                "Failed to persist send record; aborting batch"
            );
            return Err(DispatchError::persistence(e));
        }

        debug!(
            campaign_id = %batch.campaign.id,
            recipient_id = %recipient.id,
            outcome = %record.outcome,
            "Send recorded"
        );

        Ok(Some(Attempt {
            email: recipient.email.clone(),
            outcome,
        }))
    }
}

// ============================================================================
// Test utilities — shared campaign fixtures
// ============================================================================
