//! HTTP API Lambda for campaign dispatch and opt-outs.
//!
//! Thin adapter: converts `lambda_http` types to/from `api::ApiRequest` /
//! `api::ApiResponse` and delegates all routing and business logic to
//! `api::handle`.

use aws_config::BehaviorVersion;
use campaign_dispatch::api::{self, ApiRequest, ApiResponse, AppState};
use campaign_dispatch::config::Config;
use campaign_dispatch::dispatch::DispatchEngine;
use campaign_dispatch::storage::DynamoStorage;
use campaign_dispatch::transport::SmtpTransport;
use lambda_http::{Body, Error, Request, RequestExt, Response, run, service_fn};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type State = AppState<DynamoStorage, SmtpTransport>;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env().map_err(|e| Error::from(format!("{:#}", e)))?;

    let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let dynamodb_client = aws_sdk_dynamodb::Client::new(&aws_config);

    let storage = Arc::new(DynamoStorage::new(
        dynamodb_client,
        config.dynamodb_table.clone(),
    ));
    let transport = Arc::new(SmtpTransport::new(config.smtp_timeout));
    let engine = DispatchEngine::new(storage, transport, config.dispatch_settings());
    let state = Arc::new(AppState::new(engine, config.verify_timeout));

    run(service_fn(|event| handler(event, state.clone()))).await
}

async fn handler(event: Request, state: Arc<State>) -> Result<Response<Body>, Error> {
    info!(method = %event.method(), path = %event.uri().path(), "Handling request");

    let query_params = event.query_string_parameters();
    let query: HashMap<String, String> = query_params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let body = match event.body() {
        Body::Text(s) => Some(s.clone()),
        Body::Binary(b) => std::str::from_utf8(b).ok().map(str::to_string),
        _ => None,
    };

    let request = ApiRequest {
        method: event.method().to_string(),
        path: event.uri().path().to_string(),
        query,
        body,
    };

    let response = api::handle(&request, &state).await;
    to_lambda_response(response)
}

fn to_lambda_response(response: ApiResponse) -> Result<Response<Body>, Error> {
    let status = response.status();
    let content_type = response.content_type();
    let body = match response {
        ApiResponse::Html { body, .. }
        | ApiResponse::Json { body, .. }
        | ApiResponse::Text { body, .. } => body,
    };

    Ok(Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Body::from(body))?)
}
