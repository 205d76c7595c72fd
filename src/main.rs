use aws_config::BehaviorVersion;
use campaign_dispatch::config::Config;
use campaign_dispatch::dispatch::DispatchEngine;
use campaign_dispatch::scheduler;
use campaign_dispatch::storage::DynamoStorage;
use campaign_dispatch::transport::SmtpTransport;
use chrono::Utc;
use lambda_runtime::{Error, LambdaEvent, service_fn};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    lambda_runtime::run(service_fn(handler)).await?;
    Ok(())
}

async fn handler(_event: LambdaEvent<Value>) -> Result<(), Error> {
    info!("Starting campaign follow-up pass...");

    let config = Config::from_env().map_err(|e| Error::from(format!("{:#}", e)))?;

    let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let dynamodb_client = aws_sdk_dynamodb::Client::new(&aws_config);
    let storage = Arc::new(DynamoStorage::new(
        dynamodb_client,
        config.dynamodb_table.clone(),
    ));
    let transport = Arc::new(SmtpTransport::new(config.smtp_timeout));
    let engine = DispatchEngine::new(storage, transport, config.dispatch_settings());

    let report = scheduler::run_due_campaigns(&engine, Utc::now())
        .await
        .map_err(|e| Error::from(format!("{:#}", e)))?;

    info!(
        batches = report.batches,
        emails_sent = report.emails_sent,
        deferred = report.deferred,
        waiting = report.waiting,
        exhausted = report.exhausted,
        in_progress = report.in_progress,
        failed = report.failed,
        "Handler completed successfully."
    );
    Ok(())
}
