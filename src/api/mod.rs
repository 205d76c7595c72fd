//! HTTP API for dispatching campaigns and handling opt-outs.
//!
//! Framework-agnostic: accepts `ApiRequest`, returns `ApiResponse`.
//! The Lambda entry point in `src/bin/api.rs` adapts `lambda_http` types to/from
//! these and calls `handle`.

mod handlers;

use crate::dispatch::DispatchEngine;
use crate::storage::Storage;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Request / Response types
// ============================================================================

pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug)]
pub enum ApiResponse {
    Html { status: u16, body: String },
    Json { status: u16, body: String },
    Text { status: u16, body: String },
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Html { status, .. } | Self::Json { status, .. } | Self::Text { status, .. } => {
                *status
            }
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Html { body, .. } | Self::Json { body, .. } | Self::Text { body, .. } => body,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Html { .. } => "text/html; charset=utf-8",
            Self::Json { .. } => "application/json",
            Self::Text { .. } => "text/plain; charset=utf-8",
        }
    }

    pub fn body_contains(&self, s: &str) -> bool {
        self.body().contains(s)
    }
}

// ============================================================================
// Application state
// ============================================================================

pub struct AppState<S: Storage, T: Transport> {
    pub(crate) engine: DispatchEngine<S, T>,
    pub(crate) verify_timeout: Duration,
}

impl<S: Storage, T: Transport> AppState<S, T> {
    pub fn new(engine: DispatchEngine<S, T>, verify_timeout: Duration) -> Self {
        Self {
            engine,
            verify_timeout,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

pub async fn handle<S, T>(request: &ApiRequest, state: &Arc<AppState<S, T>>) -> ApiResponse
where
    S: Storage,
    T: Transport,
{
    let email = request.query.get("email").map(|s| s.as_str()).unwrap_or("");
    let uid = request.query.get("uid").map(|s| s.as_str()).unwrap_or("");
    let body = request.body.as_deref().unwrap_or("");

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/send") => handlers::send_post(state, body).await,
        ("POST", "/api/test-smtp") => handlers::test_smtp_post(state, body).await,
        ("GET", "/api/unsubscribe") => {
            handlers::unsubscribe_get(state.engine.storage(), email, uid).await
        }
        ("POST", "/api/unsubscribe") => {
            handlers::unsubscribe_post(state.engine.storage(), email, uid, request.body.as_deref())
                .await
        }
        ("POST", "/api/campaigns/pause") => handlers::pause_post(state, body).await,
        ("POST", "/api/campaigns/resume") => handlers::resume_post(state, body).await,
        _ => ApiResponse::Text {
            status: 404,
            body: "Not Found".to_string(),
        },
    }
}
