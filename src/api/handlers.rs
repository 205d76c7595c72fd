use super::{ApiResponse, AppState};
use crate::dispatch::{BatchResult, DispatchOutcome};
use crate::error::{DispatchError, OptOutError, PreconditionError};
use crate::lifecycle::CampaignStatus;
use crate::opt_out;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::SmtpCredentials;
use askama::Template;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Templates
// ============================================================================

/// Opt-out landing page. `error` switches to the parameter-error variant.
#[derive(Template)]
#[template(path = "unsubscribe.html")]
struct UnsubscribeTemplate<'a> {
    email: &'a str,
    error: Option<&'a str>,
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct CampaignRequest {
    #[serde(rename = "campaignId", alias = "campaign_id", default)]
    campaign_id: String,
    #[serde(rename = "tenantId", alias = "tenant_id", alias = "user_id", default)]
    tenant_id: String,
}

#[derive(Debug, Deserialize)]
struct TestSmtpRequest {
    #[serde(default)]
    smtp_host: String,
    #[serde(default)]
    smtp_port: Option<serde_json::Value>,
    #[serde(default)]
    smtp_user: String,
    #[serde(default)]
    smtp_pass: String,
}

// ============================================================================
// Response helpers
// ============================================================================

fn json(status: u16, body: serde_json::Value) -> ApiResponse {
    ApiResponse::Json {
        status,
        body: body.to_string(),
    }
}

fn json_error(status: u16, message: &str) -> ApiResponse {
    json(status, json!({ "error": message }))
}

fn text(status: u16, body: &str) -> ApiResponse {
    ApiResponse::Text {
        status,
        body: body.to_string(),
    }
}

fn parse_campaign_request(body: &str) -> Result<CampaignRequest, ApiResponse> {
    let req: CampaignRequest = serde_json::from_str(body).map_err(|e| {
        warn!(error = %e, "Failed to parse campaign request");
        json_error(400, "Invalid request body")
    })?;

    if req.campaign_id.trim().is_empty() || req.tenant_id.trim().is_empty() {
        return Err(json_error(400, "Missing campaign_id or user_id"));
    }
    Ok(req)
}

fn dispatch_error_response(err: DispatchError) -> ApiResponse {
    match err {
        DispatchError::Precondition(PreconditionError::CampaignNotFound) => {
            json_error(404, &PreconditionError::CampaignNotFound.to_string())
        }
        DispatchError::Precondition(PreconditionError::BatchInProgress) => {
            json_error(409, &PreconditionError::BatchInProgress.to_string())
        }
        DispatchError::Precondition(e) => json_error(400, &e.to_string()),
        DispatchError::Persistence(e) => {
            error!(error = ?e, "Persistence failure during dispatch");
            json_error(500, "Internal server error, please try again later")
        }
    }
}

fn batch_response(result: &BatchResult) -> ApiResponse {
    let mut body = json!({
        "success": true,
        "sent": result.sent,
        "failed": result.bounced,
        "total": result.total,
        "skippedUnsubscribed": result.skipped_unsubscribed,
        "skippedAlreadySent": result.skipped_already_sent,
        "stepIndex": result.step_index,
        "runId": result.run_id,
        "status": result.status,
    });
    if !result.errors.is_empty() {
        body["errors"] = json!(result.errors);
    }
    json(200, body)
}

fn status_response(status: CampaignStatus) -> ApiResponse {
    json(200, json!({ "success": true, "status": status }))
}

fn page(email: &str, error: Option<&str>) -> ApiResponse {
    match (UnsubscribeTemplate { email, error }).render() {
        Ok(html) => ApiResponse::Html { status: 200, body: html },
        Err(e) => {
            error!(error = %e, "Failed to render unsubscribe template");
            text(500, "Internal server error")
        }
    }
}

/// Port given as a JSON number or a numeric string. `Err` if present but invalid.
fn parse_port(value: Option<&serde_json::Value>) -> Result<Option<u16>, ()> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or(()),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s.trim().parse().map(Some).map_err(|_| ()),
        Some(_) => Err(()),
    }
}

// ============================================================================
// Route handlers
// ============================================================================

/// POST /api/send
///
/// Dispatches the campaign's due step, or defers it until its scheduled time.
pub(super) async fn send_post<S, T>(state: &Arc<AppState<S, T>>, body: &str) -> ApiResponse
where
    S: Storage,
    T: Transport,
{
    let req = match parse_campaign_request(body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    info!(campaign_id = %req.campaign_id, tenant_id = %req.tenant_id, "Dispatch requested");

    match state.engine.dispatch(&req.campaign_id, &req.tenant_id).await {
        Ok(DispatchOutcome::Batch(result)) => batch_response(&result),
        Ok(DispatchOutcome::Scheduled { scheduled_at }) => json(
            200,
            json!({
                "success": true,
                "scheduled": true,
                "scheduledAt": scheduled_at,
            }),
        ),
        Ok(DispatchOutcome::Waiting { step_index, due_at }) => json(
            200,
            json!({
                "success": true,
                "scheduled": true,
                "scheduledAt": due_at,
                "stepIndex": step_index,
            }),
        ),
        Ok(DispatchOutcome::Exhausted) => json(
            200,
            json!({
                "success": true,
                "exhausted": true,
                "message": "All steps of this campaign have already been sent.",
            }),
        ),
        Err(e) => {
            warn!(campaign_id = %req.campaign_id, error = %e, "Dispatch rejected");
            dispatch_error_response(e)
        }
    }
}

/// POST /api/test-smtp
///
/// Handshake-only credential check. Nothing is stored.
pub(super) async fn test_smtp_post<S, T>(state: &Arc<AppState<S, T>>, body: &str) -> ApiResponse
where
    S: Storage,
    T: Transport,
{
    let req: TestSmtpRequest = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to parse test-smtp request");
            return json_error(400, "Invalid request body");
        }
    };

    let port = match parse_port(req.smtp_port.as_ref()) {
        Ok(p) => p,
        Err(()) => return json_error(400, "Invalid SMTP port"),
    };

    let credentials = SmtpCredentials {
        host: req.smtp_host,
        port,
        user: req.smtp_user,
        secret: req.smtp_pass,
    };
    if !credentials.is_complete() {
        return json_error(400, "Missing SMTP credentials");
    }

    match state
        .engine
        .transport()
        .verify(&credentials, state.verify_timeout)
        .await
    {
        Ok(()) => {
            info!(host = %credentials.host, port = credentials.port(), "SMTP verification succeeded");
            json(
                200,
                json!({ "success": true, "message": "SMTP connection successful!" }),
            )
        }
        Err(e) => {
            warn!(host = %credentials.host, error = %e, "SMTP verification failed");
            json_error(400, &format!("SMTP connection failed: {:#}", e))
        }
    }
}

/// GET /api/unsubscribe?email=...&uid=...
///
/// Always answers with a page, never a raw error.
pub(super) async fn unsubscribe_get<S: Storage>(
    storage: &S,
    email: &str,
    tenant_id: &str,
) -> ApiResponse {
    match opt_out::record_opt_out(storage, tenant_id, email).await {
        Ok(_) => page(email.trim(), None),
        Err(OptOutError::InvalidParameters) => page("", Some("Missing or invalid parameters.")),
        Err(e) => {
            error!(error = %e, "Error recording opt-out");
            page(
                "",
                Some("We could not process your request. Please try again later."),
            )
        }
    }
}

/// POST /api/unsubscribe?email=...&uid=...
///
/// RFC 8058 one-click unsubscribe. Mail clients expect a plain 200.
pub(super) async fn unsubscribe_post<S: Storage>(
    storage: &S,
    email: &str,
    tenant_id: &str,
    body: Option<&str>,
) -> ApiResponse {
    let is_one_click = body
        .map(|b| b.contains("List-Unsubscribe=One-Click"))
        .unwrap_or(false);

    if is_one_click {
        info!(tenant_id = %tenant_id, "Processing RFC 8058 one-click unsubscribe");
    }

    match opt_out::record_opt_out(storage, tenant_id, email).await {
        Ok(_) => text(200, "Unsubscribed successfully"),
        Err(OptOutError::InvalidParameters) => text(400, "Missing or invalid parameters"),
        Err(e) => {
            error!(error = %e, "Error recording opt-out");
            text(500, "Internal server error")
        }
    }
}

/// POST /api/campaigns/pause
pub(super) async fn pause_post<S, T>(state: &Arc<AppState<S, T>>, body: &str) -> ApiResponse
where
    S: Storage,
    T: Transport,
{
    let req = match parse_campaign_request(body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.engine.pause(&req.campaign_id, &req.tenant_id).await {
        Ok(status) => status_response(status),
        Err(e) => dispatch_error_response(e),
    }
}

/// POST /api/campaigns/resume
pub(super) async fn resume_post<S, T>(state: &Arc<AppState<S, T>>, body: &str) -> ApiResponse
where
    S: Storage,
    T: Transport,
{
    let req = match parse_campaign_request(body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.engine.resume(&req.campaign_id, &req.tenant_id).await {
        Ok(status) => status_response(status),
        Err(e) => dispatch_error_response(e),
    }
}

// ============================================================================
// Tests
// ============================================================================
