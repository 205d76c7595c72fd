//! Opt-out enforcement for a dispatch batch.

use crate::types::{Recipient, normalize_email};
use std::collections::HashSet;

/// The set of addresses a tenant's recipients have opted out with.
#[derive(Debug, Clone, Default)]
pub struct SuppressionList {
    emails: HashSet<String>,
}

/// Recipients split by suppression status, each side in input order.
#[derive(Debug, Default)]
pub struct Partition {
    pub eligible: Vec<Recipient>,
    pub excluded: Vec<Recipient>,
}

impl SuppressionList {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            emails: emails
                .into_iter()
                .map(|e| normalize_email(e.as_ref()))
                .collect(),
        }
    }

    pub fn contains(&self, email: &str) -> bool {
        self.emails.contains(&normalize_email(email))
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }

    pub fn partition(&self, recipients: Vec<Recipient>) -> Partition {
        let (excluded, eligible): (Vec<_>, Vec<_>) = recipients
            .into_iter()
            .partition(|r| self.contains(&r.email));
        Partition { eligible, excluded }
    }
}
