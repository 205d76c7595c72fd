use super::{BatchClaim, Storage};
use crate::lifecycle::CampaignStatus;
use crate::types::{
    Campaign, Recipient, SendOutcome, SendRecord, SendingIdentity, SmtpCredentials, Step,
    SuppressionEntry,
};
use anyhow::{Context, Result};
use aws_sdk_dynamodb::{Client, types::AttributeValue};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use tracing::warn;

const CAMPAIGN_PARTITION_KEY: &str = "CAMPAIGN";
const SENDING_IDENTITY_PARTITION_KEY: &str = "SENDING_IDENTITY";
const LIST_PARTITION_KEY_PREFIX: &str = "LIST";
const SUPPRESSION_PARTITION_KEY_PREFIX: &str = "SUPPRESSION";
const SENDS_PARTITION_KEY_PREFIX: &str = "SENDS";
const STATUS_INDEX: &str = "status_index";

type Item = HashMap<String, AttributeValue>;

// ============================================================================
// DynamoStorage — DynamoDB-backed Storage implementation
// ============================================================================

pub struct DynamoStorage {
    client: Client,
    table_name: String,
}

impl DynamoStorage {
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }

    async fn get(&self, pk: String, sk: &str, what: &str) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("PK", AttributeValue::S(pk))
            .key("SK", AttributeValue::S(sk.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", what))?;
        Ok(output.item)
    }

    /// Every item in a partition, in sort-key order.
    async fn query_partition(&self, pk: String, what: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut req = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("PK = :pk")
                .expression_attribute_values(":pk", AttributeValue::S(pk.clone()));

            if let Some(start_key) = exclusive_start_key {
                req = req.set_exclusive_start_key(Some(start_key));
            }

            let output = req
                .send()
                .await
                .with_context(|| format!("Failed to query {}", what))?;

            items.extend(output.items.unwrap_or_default());

            exclusive_start_key = output.last_evaluated_key;
            if exclusive_start_key.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

impl Storage for DynamoStorage {
    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        self.get(CAMPAIGN_PARTITION_KEY.to_string(), campaign_id, "campaign")
            .await?
            .map(campaign_from_item)
            .transpose()
    }

    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(
                "PK",
                AttributeValue::S(CAMPAIGN_PARTITION_KEY.to_string()),
            )
            .key("SK", AttributeValue::S(campaign_id.to_string()))
            .update_expression("SET #status = :status")
            .condition_expression("attribute_exists(SK)")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":status", AttributeValue::S(status.to_string()))
            .send()
            .await
            .context("Failed to update campaign status")?;

        Ok(())
    }

    async fn get_pending_campaigns(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let mut campaigns = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut req = self
                .client
                .query()
                .table_name(&self.table_name)
                .index_name(STATUS_INDEX)
                .key_condition_expression("#status = :status")
                .filter_expression("attribute_not_exists(exhausted) OR exhausted = :false")
                .expression_attribute_names("#status", "status")
                .expression_attribute_values(":status", AttributeValue::S(status.to_string()))
                .expression_attribute_values(":false", AttributeValue::Bool(false));

            if let Some(start_key) = exclusive_start_key {
                req = req.set_exclusive_start_key(Some(start_key));
            }

            let output = req
                .send()
                .await
                .context("Failed to query campaigns by status")?;

            if let Some(items) = output.items {
                for item in items {
                    campaigns.push(campaign_from_item(item)?);
                }
            }

            exclusive_start_key = output.last_evaluated_key;
            if exclusive_start_key.is_none() {
                break;
            }
        }

        Ok(campaigns)
    }

    async fn mark_exhausted(&self, campaign_id: &str) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(
                "PK",
                AttributeValue::S(CAMPAIGN_PARTITION_KEY.to_string()),
            )
            .key("SK", AttributeValue::S(campaign_id.to_string()))
            .update_expression("SET exhausted = :exhausted")
            .condition_expression("attribute_exists(SK)")
            .expression_attribute_values(":exhausted", AttributeValue::Bool(true))
            .send()
            .await
            .context("Failed to mark campaign exhausted")?;

        Ok(())
    }

    async fn claim_batch(&self, claim: &BatchClaim<'_>) -> Result<bool> {
        let mut req = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key(
                "PK",
                AttributeValue::S(CAMPAIGN_PARTITION_KEY.to_string()),
            )
            .key("SK", AttributeValue::S(claim.campaign_id.to_string()))
            .update_expression(
                "SET #status = :active, run_id = :run_id, lease_until = :lease_until",
            )
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(
                ":active",
                AttributeValue::S(CampaignStatus::Active.to_string()),
            )
            .expression_attribute_values(":from", AttributeValue::S(claim.from.to_string()))
            .expression_attribute_values(":run_id", AttributeValue::S(claim.run_id.to_string()))
            .expression_attribute_values(
                ":lease_until",
                AttributeValue::S(lease_timestamp(claim.lease_until)),
            )
            .expression_attribute_values(":now", AttributeValue::S(lease_timestamp(claim.now)));

        let owner = match claim.previous_run {
            Some(previous) => {
                req = req.expression_attribute_values(
                    ":previous_run",
                    AttributeValue::S(previous.to_string()),
                );
                "run_id = :previous_run"
            }
            None => "attribute_not_exists(run_id)",
        };
        let result = req
            .condition_expression(format!(
                "#status = :from AND {} AND (attribute_not_exists(lease_until) OR lease_until < :now)",
                owner
            ))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to claim campaign batch")),
        }
    }

    async fn release_batch(
        &self,
        campaign_id: &str,
        run_id: &str,
        status: CampaignStatus,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.table_name)
            .key(
                "PK",
                AttributeValue::S(CAMPAIGN_PARTITION_KEY.to_string()),
            )
            .key("SK", AttributeValue::S(campaign_id.to_string()))
            .update_expression("SET #status = :status REMOVE lease_until")
            .condition_expression("run_id = :run_id")
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":status", AttributeValue::S(status.to_string()))
            .expression_attribute_values(":run_id", AttributeValue::S(run_id.to_string()))
            .send()
            .await
            .with_context(|| format!("Failed to release batch {}", run_id))?;

        Ok(())
    }

    async fn get_sending_identity(&self, account_id: &str) -> Result<Option<SendingIdentity>> {
        self.get(
            SENDING_IDENTITY_PARTITION_KEY.to_string(),
            account_id,
            "sending identity",
        )
        .await?
        .map(identity_from_item)
        .transpose()
    }

    async fn get_recipients(&self, list_id: &str) -> Result<Vec<Recipient>> {
        self.query_partition(list_pk(list_id), "recipients")
            .await?
            .into_iter()
            .map(recipient_from_item)
            .collect()
    }

    async fn get_suppressed_emails(&self, tenant_id: &str) -> Result<Vec<String>> {
        self.query_partition(suppression_pk(tenant_id), "suppressions")
            .await?
            .into_iter()
            .map(|item| get_s(&item, "SK").map(str::to_string))
            .collect()
    }

    async fn insert_suppression(&self, entry: &SuppressionEntry) -> Result<bool> {
        let item = HashMap::from([
            (
                "PK".to_string(),
                AttributeValue::S(suppression_pk(&entry.tenant_id)),
            ),
            ("SK".to_string(), AttributeValue::S(entry.email.clone())),
            (
                "tenant_id".to_string(),
                AttributeValue::S(entry.tenant_id.clone()),
            ),
            (
                "created_at".to_string(),
                AttributeValue::S(entry.created_at.to_rfc3339()),
            ),
        ]);

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(SK)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert suppression")),
        }
    }

    async fn get_send_records(&self, campaign_id: &str) -> Result<Vec<SendRecord>> {
        self.query_partition(sends_pk(campaign_id), "send records")
            .await?
            .into_iter()
            .map(send_record_from_item)
            .collect()
    }

    async fn put_send_record(&self, record: &SendRecord) -> Result<()> {
        let mut item = HashMap::from([
            (
                "PK".to_string(),
                AttributeValue::S(sends_pk(&record.campaign_id)),
            ),
            (
                "SK".to_string(),
                AttributeValue::S(send_record_sk(record.step_index, &record.recipient_id)),
            ),
            (
                "campaign_id".to_string(),
                AttributeValue::S(record.campaign_id.clone()),
            ),
            (
                "tenant_id".to_string(),
                AttributeValue::S(record.tenant_id.clone()),
            ),
            (
                "recipient_id".to_string(),
                AttributeValue::S(record.recipient_id.clone()),
            ),
            ("email".to_string(), AttributeValue::S(record.email.clone())),
            (
                "step_index".to_string(),
                AttributeValue::N(record.step_index.to_string()),
            ),
            (
                "outcome".to_string(),
                AttributeValue::S(record.outcome.to_string()),
            ),
            (
                "attempted_at".to_string(),
                AttributeValue::S(record.attempted_at.to_rfc3339()),
            ),
            ("run_id".to_string(), AttributeValue::S(record.run_id.clone())),
        ]);
        if let Some(error) = &record.error {
            item.insert("error".to_string(), AttributeValue::S(error.clone()));
        }

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(SK) OR outcome <> :sent")
            .expression_attribute_values(":sent", AttributeValue::S(SendOutcome::Sent.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                warn!(
                    campaign_id = %record.campaign_id,
                    recipient_id = %record.recipient_id,
                    step_index = record.step_index,
                    "Send record already marked sent; keeping it"
                );
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to save send record")),
        }
    }
}

// ============================================================================
// Key helpers
// ============================================================================

fn list_pk(list_id: &str) -> String {
    format!("{}#{}", LIST_PARTITION_KEY_PREFIX, list_id)
}

fn suppression_pk(tenant_id: &str) -> String {
    format!("{}#{}", SUPPRESSION_PARTITION_KEY_PREFIX, tenant_id)
}

fn sends_pk(campaign_id: &str) -> String {
    format!("{}#{}", SENDS_PARTITION_KEY_PREFIX, campaign_id)
}

fn send_record_sk(step_index: usize, recipient_id: &str) -> String {
    format!("{:04}#{}", step_index, recipient_id)
}

/// Fixed-width UTC form so lease timestamps compare correctly as strings.
fn lease_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Serialization helpers
// ============================================================================

fn av_to_json(av: &AttributeValue) -> Result<serde_json::Value> {
    Ok(match av {
        AttributeValue::Null(_) => serde_json::Value::Null,
        AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(Into::into)
            .or_else(|_| n.parse::<f64>().map(Into::into))
            .unwrap_or_else(|_| serde_json::Value::String(n.clone())),
        AttributeValue::S(s) => serde_json::Value::String(s.clone()),
        AttributeValue::L(list) => {
            serde_json::Value::Array(list.iter().map(av_to_json).collect::<Result<_>>()?)
        }
        AttributeValue::M(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| av_to_json(v).map(|json| (k.clone(), json)))
                .collect::<Result<_>>()?,
        ),
        _ => serde_json::Value::Null, // Ignore binary/set types (non-exhaustive enum)
    })
}

fn get_s<'a>(item: &'a Item, key: &str) -> Result<&'a str> {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing {} field", key))
}

fn opt_s(item: &Item, key: &str) -> Option<String> {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .filter(|s| !s.is_empty())
        .cloned()
}

fn opt_n<T: std::str::FromStr>(item: &Item, key: &str) -> Result<Option<T>> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .map(|n| {
            n.parse::<T>()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", key, n))
        })
        .transpose()
}

fn parse_timestamp(value: &str, key: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .with_context(|| format!("Invalid {} timestamp", key))
}

pub(crate) fn campaign_from_item(item: Item) -> Result<Campaign> {
    let steps = match item.get("steps") {
        Some(av) => serde_json::from_value::<Vec<Step>>(av_to_json(av)?)
            .context("Invalid steps value")?,
        None => Vec::new(),
    };

    let scheduled_at = opt_s(&item, "scheduled_at")
        .map(|s| parse_timestamp(&s, "scheduled_at"))
        .transpose()?;

    let status = get_s(&item, "status")?
        .parse::<CampaignStatus>()
        .context("Invalid status value")?;

    let lease_until = opt_s(&item, "lease_until")
        .map(|s| parse_timestamp(&s, "lease_until"))
        .transpose()?;

    Ok(Campaign {
        id: get_s(&item, "SK")?.to_string(),
        tenant_id: get_s(&item, "tenant_id")?.to_string(),
        name: opt_s(&item, "name").unwrap_or_default(),
        steps,
        account_id: opt_s(&item, "account_id"),
        list_id: get_s(&item, "list_id")?.to_string(),
        scheduled_at,
        status,
        run_id: opt_s(&item, "run_id"),
        lease_until,
        exhausted: item
            .get("exhausted")
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false),
    })
}

pub(crate) fn identity_from_item(item: Item) -> Result<SendingIdentity> {
    Ok(SendingIdentity {
        id: get_s(&item, "SK")?.to_string(),
        tenant_id: get_s(&item, "tenant_id")?.to_string(),
        email: get_s(&item, "email")?.to_string(),
        smtp: SmtpCredentials {
            host: opt_s(&item, "smtp_host").unwrap_or_default(),
            port: opt_n(&item, "smtp_port")?,
            user: opt_s(&item, "smtp_user").unwrap_or_default(),
            secret: opt_s(&item, "smtp_pass").unwrap_or_default(),
        },
        daily_limit: opt_n(&item, "daily_limit")?,
    })
}

pub(crate) fn recipient_from_item(item: Item) -> Result<Recipient> {
    Ok(Recipient {
        id: get_s(&item, "id")?.to_string(),
        email: get_s(&item, "email")?.to_string(),
        first_name: opt_s(&item, "first_name"),
        last_name: opt_s(&item, "last_name"),
        name: opt_s(&item, "name"),
        company: opt_s(&item, "company"),
    })
}

pub(crate) fn send_record_from_item(item: Item) -> Result<SendRecord> {
    let outcome = get_s(&item, "outcome")?
        .parse::<SendOutcome>()
        .context("Invalid outcome value")?;
    let step_index = opt_n::<usize>(&item, "step_index")?
        .ok_or_else(|| anyhow::anyhow!("Missing step_index field"))?;

    Ok(SendRecord {
        campaign_id: get_s(&item, "campaign_id")?.to_string(),
        tenant_id: get_s(&item, "tenant_id")?.to_string(),
        recipient_id: get_s(&item, "recipient_id")?.to_string(),
        email: get_s(&item, "email")?.to_string(),
        step_index,
        outcome,
        attempted_at: parse_timestamp(get_s(&item, "attempted_at")?, "attempted_at")?,
        run_id: opt_s(&item, "run_id").unwrap_or_default(),
        error: opt_s(&item, "error"),
    })
}

// ============================================================================
// Tests — DynamoDB serialization helpers (no network required)
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_string())
    }

    fn json_to_av(json: &serde_json::Value) -> Result<AttributeValue> {
        Ok(match json {
            serde_json::Value::Null => AttributeValue::Null(true),
            serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
            serde_json::Value::Number(n) => AttributeValue::N(n.to_string()),
            serde_json::Value::String(s) => AttributeValue::S(s.clone()),
            serde_json::Value::Array(arr) => {
                AttributeValue::L(arr.iter().map(json_to_av).collect::<Result<_>>()?)
            }
            serde_json::Value::Object(map) => AttributeValue::M(
                map.iter()
                    .map(|(k, v)| json_to_av(v).map(|av| (k.clone(), av)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    fn steps_to_av(steps: &[Step]) -> AttributeValue {
        json_to_av(&serde_json::to_value(steps).unwrap()).unwrap()
    }

    fn campaign_item() -> Item {
        let steps = vec![
            Step::new("Hi {{first_name}}", "Body one", 0),
            Step::new("Following up", "Body two", 3),
        ];
        HashMap::from([
            ("PK".to_string(), s(CAMPAIGN_PARTITION_KEY)),
            ("SK".to_string(), s("camp-1")),
            ("tenant_id".to_string(), s("tenant-1")),
            ("name".to_string(), s("Launch")),
            ("steps".to_string(), steps_to_av(&steps)),
            ("account_id".to_string(), s("acc-1")),
            ("list_id".to_string(), s("list-1")),
            ("scheduled_at".to_string(), s("2024-01-01T09:00:00+00:00")),
            ("status".to_string(), s("draft")),
        ])
    }

    #[test]
    fn campaign_from_item_valid() {
        let campaign = campaign_from_item(campaign_item()).unwrap();
        assert_eq!(campaign.id, "camp-1");
        assert_eq!(campaign.tenant_id, "tenant-1");
        assert_eq!(campaign.steps.len(), 2);
        assert_eq!(campaign.steps[1].delay, 3);
        assert_eq!(campaign.account_id.as_deref(), Some("acc-1"));
        assert_eq!(campaign.status, CampaignStatus::Draft);
        assert!(campaign.scheduled_at.is_some());
    }

    #[test]
    fn campaign_from_item_without_claim_is_unclaimed() {
        let campaign = campaign_from_item(campaign_item()).unwrap();
        assert!(campaign.run_id.is_none());
        assert!(campaign.lease_until.is_none());
        assert!(!campaign.exhausted);
    }

    #[test]
    fn campaign_from_item_reads_claim_and_exhausted_marker() {
        let mut item = campaign_item();
        item.insert("run_id".to_string(), s("run-7"));
        item.insert("lease_until".to_string(), s("2024-01-01T09:15:00.000Z"));
        item.insert("exhausted".to_string(), AttributeValue::Bool(true));

        let campaign = campaign_from_item(item).unwrap();

        assert_eq!(campaign.run_id.as_deref(), Some("run-7"));
        assert_eq!(
            campaign.lease_until.map(lease_timestamp),
            Some("2024-01-01T09:15:00.000Z".to_string())
        );
        assert!(campaign.exhausted);
    }

    #[test]
    fn lease_timestamps_sort_chronologically() {
        let early = "2024-01-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let later = early + chrono::Duration::milliseconds(1500);
        assert_eq!(lease_timestamp(early), "2024-01-01T09:00:00.000Z");
        assert!(lease_timestamp(early) < lease_timestamp(later));
    }

    #[test]
    fn campaign_from_item_invalid_status() {
        let mut item = campaign_item();
        item.insert("status".to_string(), s("archived"));
        assert!(campaign_from_item(item).is_err());
    }

    #[test]
    fn campaign_from_item_empty_schedule_is_none() {
        let mut item = campaign_item();
        item.insert("scheduled_at".to_string(), s(""));
        assert!(campaign_from_item(item).unwrap().scheduled_at.is_none());
    }

    #[test]
    fn identity_from_item_reads_optional_numbers() {
        let item = HashMap::from([
            ("SK".to_string(), s("acc-1")),
            ("tenant_id".to_string(), s("tenant-1")),
            ("email".to_string(), s("sales@sender.com")),
            ("smtp_host".to_string(), s("smtp.sender.com")),
            ("smtp_port".to_string(), AttributeValue::N("465".to_string())),
            ("smtp_user".to_string(), s("sales@sender.com")),
            ("smtp_pass".to_string(), s("secret")),
            ("daily_limit".to_string(), AttributeValue::N("50".to_string())),
        ]);
        let identity = identity_from_item(item).unwrap();
        assert_eq!(identity.smtp.port(), 465);
        assert_eq!(identity.daily_limit, Some(50));
        assert!(identity.smtp.is_complete());
    }

    #[test]
    fn identity_without_credentials_is_incomplete() {
        let item = HashMap::from([
            ("SK".to_string(), s("acc-1")),
            ("tenant_id".to_string(), s("tenant-1")),
            ("email".to_string(), s("sales@sender.com")),
        ]);
        let identity = identity_from_item(item).unwrap();
        assert!(!identity.smtp.is_complete());
        assert_eq!(identity.daily_limit, None);
    }

    #[test]
    fn recipient_from_item_missing_email() {
        let item = HashMap::from([("id".to_string(), s("r1"))]);
        assert!(recipient_from_item(item).is_err());
    }

    #[test]
    fn send_record_from_item_valid() {
        let item = HashMap::from([
            ("campaign_id".to_string(), s("camp-1")),
            ("tenant_id".to_string(), s("tenant-1")),
            ("recipient_id".to_string(), s("r1")),
            ("email".to_string(), s("a@x.com")),
            ("step_index".to_string(), AttributeValue::N("2".to_string())),
            ("outcome".to_string(), s("bounced")),
            ("attempted_at".to_string(), s("2024-01-01T00:00:00+00:00")),
            ("run_id".to_string(), s("run-1")),
            ("error".to_string(), s("550 rejected")),
        ]);
        let record = send_record_from_item(item).unwrap();
        assert_eq!(record.step_index, 2);
        assert_eq!(record.outcome, SendOutcome::Bounced);
        assert_eq!(record.error.as_deref(), Some("550 rejected"));
    }

    #[test]
    fn send_record_sort_key_orders_by_step() {
        assert_eq!(send_record_sk(1, "r9"), "0001#r9");
        assert!(send_record_sk(2, "a") < send_record_sk(10, "a"));
    }
}
