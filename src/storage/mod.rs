use crate::lifecycle::CampaignStatus;
use crate::types::{Campaign, Recipient, SendRecord, SendingIdentity, SuppressionEntry};
use anyhow::Result;
use chrono::{DateTime, Utc};

pub mod dynamo;
pub use dynamo::DynamoStorage;

/// Conditional hand-over of a campaign to one batch run.
#[derive(Debug, Clone)]
pub struct BatchClaim<'a> {
    pub campaign_id: &'a str,
    /// Status the campaign had when it was loaded.
    pub from: CampaignStatus,
    /// `run_id` the campaign had when it was loaded.
    pub previous_run: Option<&'a str>,
    pub run_id: &'a str,
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

// ============================================================================
// Storage trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait Storage: Send + Sync {
    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>>;
    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<()>;
    /// Campaigns in `status` that are not yet marked exhausted.
    async fn get_pending_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    async fn mark_exhausted(&self, campaign_id: &str) -> Result<()>;

    /// Move the campaign to `active` under `claim.run_id`. Returns `false`
    /// when the campaign changed since it was loaded or another run still
    /// holds an unexpired lease.
    async fn claim_batch(&self, claim: &BatchClaim<'_>) -> Result<bool>;
    /// Set the status a finished (or aborted) run reached and drop its lease.
    /// Fails if another run has taken the campaign over.
    async fn release_batch(
        &self,
        campaign_id: &str,
        run_id: &str,
        status: CampaignStatus,
    ) -> Result<()>;

    async fn get_sending_identity(&self, account_id: &str) -> Result<Option<SendingIdentity>>;

    /// Recipients of a list, in the list's stored order.
    async fn get_recipients(&self, list_id: &str) -> Result<Vec<Recipient>>;

    async fn get_suppressed_emails(&self, tenant_id: &str) -> Result<Vec<String>>;
    /// Returns `false` when the (tenant, email) pair was already recorded.
    async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool>;

    async fn get_send_records(&self, campaign_id: &str) -> Result<Vec<SendRecord>>;
    /// Upsert keyed by (campaign, step, recipient). An existing `sent` record
    /// is never overwritten.
    async fn put_send_record(&self, record: &SendRecord) -> Result<()>;
}

// ============================================================================
// Test utilities — InMemoryStorage for in-crate tests
// ============================================================================

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::types::normalize_email;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct InMemoryStorage {
        pub campaigns: Mutex<HashMap<String, Campaign>>,
        pub identities: Mutex<HashMap<String, SendingIdentity>>,
        pub lists: Mutex<HashMap<String, Vec<Recipient>>>,
        pub suppressions: Mutex<HashSet<(String, String)>>,
        pub records: Mutex<Vec<SendRecord>>,
        pub status_history: Mutex<Vec<CampaignStatus>>,
        record_writes_left: Mutex<Option<usize>>,
        failing_record_ids: Mutex<HashSet<String>>,
        fail_suppression_writes: Mutex<bool>,
    }

    impl InMemoryStorage {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_campaign(self, c: Campaign) -> Self {
            self.campaigns.lock().unwrap().insert(c.id.clone(), c);
            self
        }

        pub(crate) fn with_identity(self, i: SendingIdentity) -> Self {
            self.identities.lock().unwrap().insert(i.id.clone(), i);
            self
        }

        pub(crate) fn with_list(self, list_id: &str, recipients: Vec<Recipient>) -> Self {
            self.lists
                .lock()
                .unwrap()
                .insert(list_id.to_string(), recipients);
            self
        }

        pub(crate) fn with_suppression(self, tenant_id: &str, email: &str) -> Self {
            self.suppressions
                .lock()
                .unwrap()
                .insert((tenant_id.to_string(), normalize_email(email)));
            self
        }

        pub(crate) fn with_record(self, r: SendRecord) -> Self {
            self.records.lock().unwrap().push(r);
            self
        }

        /// Accept `n` more send-record writes, then fail every write.
        pub(crate) fn failing_record_writes_after(self, n: usize) -> Self {
            *self.record_writes_left.lock().unwrap() = Some(n);
            self
        }

        /// Fail every send-record write for one recipient.
        pub(crate) fn failing_record_write_for(self, recipient_id: &str) -> Self {
            self.failing_record_ids
                .lock()
                .unwrap()
                .insert(recipient_id.to_string());
            self
        }

        pub(crate) fn failing_suppression_writes(self) -> Self {
            *self.fail_suppression_writes.lock().unwrap() = true;
            self
        }

        pub(crate) fn campaign(&self, campaign_id: &str) -> Option<Campaign> {
            self.campaigns.lock().unwrap().get(campaign_id).cloned()
        }

        pub(crate) fn status_of(&self, campaign_id: &str) -> Option<CampaignStatus> {
            self.campaign(campaign_id).map(|c| c.status)
        }

        pub(crate) fn record_count(&self) -> usize {
            self.records.lock().unwrap().len()
        }

        pub(crate) fn records(&self) -> Vec<SendRecord> {
            self.records.lock().unwrap().clone()
        }

        pub(crate) fn suppression_count(&self) -> usize {
            self.suppressions.lock().unwrap().len()
        }

        pub(crate) fn is_suppressed(&self, tenant_id: &str, email: &str) -> bool {
            self.suppressions
                .lock()
                .unwrap()
                .contains(&(tenant_id.to_string(), normalize_email(email)))
        }
    }

    impl Storage for InMemoryStorage {
        async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
            Ok(self.campaign(campaign_id))
        }

        async fn set_campaign_status(
            &self,
            campaign_id: &str,
            status: CampaignStatus,
        ) -> Result<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(campaign_id) {
                c.status = status;
            }
            self.status_history.lock().unwrap().push(status);
            Ok(())
        }

        async fn get_pending_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
            let mut found: Vec<Campaign> = self
                .campaigns
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.status == status && !c.exhausted)
                .cloned()
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(found)
        }

        async fn mark_exhausted(&self, campaign_id: &str) -> Result<()> {
            if let Some(c) = self.campaigns.lock().unwrap().get_mut(campaign_id) {
                c.exhausted = true;
            }
            Ok(())
        }

        async fn claim_batch(&self, claim: &BatchClaim<'_>) -> Result<bool> {
            {
                let mut campaigns = self.campaigns.lock().unwrap();
                let Some(c) = campaigns.get_mut(claim.campaign_id) else {
                    return Ok(false);
                };
                let lease_free = c.lease_until.is_none_or(|until| until < claim.now);
                if c.status != claim.from
                    || c.run_id.as_deref() != claim.previous_run
                    || !lease_free
                {
                    return Ok(false);
                }
                c.status = CampaignStatus::Active;
                c.run_id = Some(claim.run_id.to_string());
                c.lease_until = Some(claim.lease_until);
            }
            self.status_history
                .lock()
                .unwrap()
                .push(CampaignStatus::Active);
            Ok(true)
        }

        async fn release_batch(
            &self,
            campaign_id: &str,
            run_id: &str,
            status: CampaignStatus,
        ) -> Result<()> {
            {
                let mut campaigns = self.campaigns.lock().unwrap();
                let Some(c) = campaigns
                    .get_mut(campaign_id)
                    .filter(|c| c.run_id.as_deref() == Some(run_id))
                else {
                    anyhow::bail!("batch lease for {} is held by another run", campaign_id);
                };
                c.status = status;
                c.lease_until = None;
            }
            self.status_history.lock().unwrap().push(status);
            Ok(())
        }

        async fn get_sending_identity(&self, account_id: &str) -> Result<Option<SendingIdentity>> {
            Ok(self.identities.lock().unwrap().get(account_id).cloned())
        }

        async fn get_recipients(&self, list_id: &str) -> Result<Vec<Recipient>> {
            Ok(self
                .lists
                .lock()
                .unwrap()
                .get(list_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn get_suppressed_emails(&self, tenant_id: &str) -> Result<Vec<String>> {
            Ok(self
                .suppressions
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == tenant_id)
                .map(|(_, e)| e.clone())
                .collect())
        }

        async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool> {
            if *self.fail_suppression_writes.lock().unwrap() {
                anyhow::bail!("suppression table unavailable");
            }
            Ok(self
                .suppressions
                .lock()
                .unwrap()
                .insert((entry.tenant_id.clone(), entry.email.clone())))
        }

        async fn get_send_records(&self, campaign_id: &str) -> Result<Vec<SendRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.campaign_id == campaign_id)
                .cloned()
                .collect())
        }

        async fn put_send_record(&self, record: &SendRecord) -> Result<()> {
            if self
                .failing_record_ids
                .lock()
                .unwrap()
                .contains(&record.recipient_id)
            {
                anyhow::bail!("send record write rejected for {}", record.recipient_id);
            }
            {
                let mut left = self.record_writes_left.lock().unwrap();
                match left.as_mut() {
                    Some(0) => anyhow::bail!("send record table unavailable"),
                    Some(n) => *n -= 1,
                    None => {}
                }
            }

            let mut records = self.records.lock().unwrap();
            let existing = records.iter_mut().find(|r| {
                r.campaign_id == record.campaign_id
                    && r.step_index == record.step_index
                    && r.recipient_id == record.recipient_id
            });
            match existing {
                Some(r) if r.is_sent() => {}
                Some(r) => *r = record.clone(),
                None => records.push(record.clone()),
            }
            Ok(())
        }
    }
}
