//! Runtime configuration read from environment variables at start-up.

use crate::dispatch::DispatchSettings;
use anyhow::{Context, Result, anyhow};
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_SEND_CONCURRENCY: usize = 1;
const DEFAULT_MIN_SEND_INTERVAL_MS: u64 = 0;
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BATCH_LEASE_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub dynamodb_table: String,
    pub base_url: String,
    pub send_concurrency: usize,
    pub min_send_interval: Duration,
    pub smtp_timeout: Duration,
    pub verify_timeout: Duration,
    pub batch_lease: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dynamodb_table = lookup("DYNAMODB_TABLE")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("DYNAMODB_TABLE environment variable must be set"))?;

        let base_url = lookup("APP_BASE_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let send_concurrency: usize =
            parse_or(&lookup, "SEND_CONCURRENCY", DEFAULT_SEND_CONCURRENCY)?;
        if send_concurrency == 0 {
            return Err(anyhow!("SEND_CONCURRENCY must be at least 1"));
        }

        Ok(Self {
            dynamodb_table,
            base_url,
            send_concurrency,
            min_send_interval: Duration::from_millis(parse_or(
                &lookup,
                "MIN_SEND_INTERVAL_MS",
                DEFAULT_MIN_SEND_INTERVAL_MS,
            )?),
            smtp_timeout: Duration::from_secs(parse_or(
                &lookup,
                "SMTP_TIMEOUT_SECS",
                DEFAULT_SMTP_TIMEOUT_SECS,
            )?),
            verify_timeout: Duration::from_secs(parse_or(
                &lookup,
                "VERIFY_TIMEOUT_SECS",
                DEFAULT_VERIFY_TIMEOUT_SECS,
            )?),
            batch_lease: Duration::from_secs(parse_or(
                &lookup,
                "BATCH_LEASE_SECS",
                DEFAULT_BATCH_LEASE_SECS,
            )?),
        })
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            base_url: self.base_url.clone(),
            send_concurrency: self.send_concurrency,
            min_send_interval: self.min_send_interval,
            send_timeout: self.smtp_timeout,
            batch_lease: self.batch_lease,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {} value: {}", key, raw)),
        _ => Ok(default),
    }
}
