use anyhow::{Context, Result, bail};
use aws_config::BehaviorVersion;
use campaign_dispatch::opt_out::{self, OptOutOutcome};
use campaign_dispatch::storage::DynamoStorage;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: cargo run --bin add-opt-out <tenant_id> <email>");
        eprintln!(
            "Example: DYNAMODB_TABLE=campaigns-staging cargo run --bin add-opt-out tenant-1 someone@example.com"
        );
        std::process::exit(1);
    }

    let tenant_id = &args[1];
    let email = &args[2];

    let dynamodb_table =
        env::var("DYNAMODB_TABLE").context("DYNAMODB_TABLE environment variable must be set")?;

    println!("Initializing DynamoDB client...");
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let dynamodb_client = aws_sdk_dynamodb::Client::new(&config);
    let storage = DynamoStorage::new(dynamodb_client, dynamodb_table);

    println!("Recording opt-out for {} (tenant {})", email, tenant_id);
    match opt_out::record_opt_out(&storage, tenant_id, email).await {
        Ok(OptOutOutcome::Recorded) => println!("Opt-out recorded."),
        Ok(OptOutOutcome::AlreadyRecorded) => println!("Address was already opted out."),
        Err(e) => bail!("Failed to record opt-out: {}", e),
    }

    Ok(())
}
