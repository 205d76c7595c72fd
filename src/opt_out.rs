use crate::error::OptOutError;
use crate::storage::Storage;
use crate::types::SuppressionEntry;
use email_address::EmailAddress;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptOutOutcome {
    Recorded,
    /// The address was already suppressed for this tenant.
    AlreadyRecorded,
}

/// Record that `email` no longer wants mail from `tenant_id`.
///
/// Idempotent: repeating the call leaves exactly one suppression entry.
pub async fn record_opt_out<S: Storage>(
    storage: &S,
    tenant_id: &str,
    email: &str,
) -> Result<OptOutOutcome, OptOutError> {
    let tenant_id = tenant_id.trim();
    if tenant_id.is_empty() || email.trim().is_empty() {
        return Err(OptOutError::InvalidParameters);
    }

    let entry = SuppressionEntry::new(tenant_id, email);
    if !EmailAddress::is_valid(&entry.email) {
        return Err(OptOutError::InvalidParameters);
    }

    let inserted = storage
        .insert_suppression(&entry)
        .await
        .map_err(OptOutError::Persistence)?;

    if inserted {
        info!(tenant_id = %entry.tenant_id, email = %entry.email, "Opt-out recorded");
        Ok(OptOutOutcome::Recorded)
    } else {
        info!(tenant_id = %entry.tenant_id, email = %entry.email, "Opt-out already on file");
        Ok(OptOutOutcome::AlreadyRecorded)
    }
}
