use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    approvals::{self, DecideApproval},
    config::Config,
    pairing::{self, PairTokenTable},
    push::PushGateway,
    runs::{self, RunEventInput},
    signature::{AuthError, RequestAuthenticator, SignatureHeaders},
    store::{RecordStore, StoreError},
    types::{Approval, ApprovalDecision, ApprovalStatus, Platform, PushNotification},
    waiter::DecisionWaiters,
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    store: Arc<dyn RecordStore>,
    authenticator: Arc<RequestAuthenticator>,
    waiters: Arc<DecisionWaiters>,
    pair_tokens: Arc<PairTokenTable>,
    push: Arc<PushGateway>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        authenticator: Arc<RequestAuthenticator>,
        waiters: Arc<DecisionWaiters>,
        pair_tokens: Arc<PairTokenTable>,
        push: Arc<PushGateway>,
    ) -> Self {
        Self {
            config,
            store,
            authenticator,
            waiters,
            pair_tokens,
            push,
            started_at: Utc::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/healthz", get(health))
        .route("/pair/start", post(pair_start))
        .route("/pair/complete", post(pair_complete))
        .route("/bridge/event", post(ingest_bridge_event))
        .route("/bridge/approval/request", post(request_approval))
        .route("/bridge/approval/:approval_id/wait", get(wait_for_decision))
        .route("/mobile/approval/:approval_id/decision", post(post_decision))
        .with_state(state)
}

const LANDING_HTML: &str = "<!doctype html>
<html>
  <head><title>AgentOps Bridge</title></head>
  <body>
    <h1>AgentOps Bridge</h1>
    <p>Supervision backend for remotely running coding agents.</p>
    <pre>
POST /pair/start
POST /pair/complete
POST /bridge/event
POST /bridge/approval/request
GET  /bridge/approval/:approval_id/wait
POST /mobile/approval/:approval_id/decision
    </pre>
  </body>
</html>
";

async fn landing() -> Html<&'static str> {
    Html(LANDING_HTML)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store_driver: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        build_sha: state.config.build_sha,
        uptime_seconds,
        store_driver: state.store.driver_name(),
    })
}

#[derive(Debug, Deserialize)]
struct PairStartBody {
    machine_id: String,
    workspace_fingerprint: String,
    display_name: String,
}

#[derive(Debug, Serialize)]
struct PairStartResponse {
    pair_token: String,
    expires_at: DateTime<Utc>,
}

async fn pair_start(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PairStartResponse>, ApiError> {
    let (_, body): (Value, PairStartBody) = parse_body(&body)?;
    require_non_empty("machine_id", &body.machine_id)?;
    require_non_empty("workspace_fingerprint", &body.workspace_fingerprint)?;
    require_non_empty("display_name", &body.display_name)?;

    let (pair_token, expires_at) = state
        .pair_tokens
        .issue(
            &body.machine_id,
            &body.workspace_fingerprint,
            &body.display_name,
        )
        .await;

    Ok(Json(PairStartResponse {
        pair_token,
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
struct PairCompleteBody {
    pair_token: String,
    platform: Platform,
    push_token: String,
}

#[derive(Debug, Serialize)]
struct PairCompleteResponse {
    device_id: String,
    bridge_secret: String,
    workspace_id: String,
}

async fn pair_complete(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PairCompleteResponse>, ApiError> {
    let (_, body): (Value, PairCompleteBody) = parse_body(&body)?;
    require_non_empty("pair_token", &body.pair_token)?;
    require_non_empty("push_token", &body.push_token)?;

    let Some(claim) = state.pair_tokens.consume(&body.pair_token).await else {
        return Err(ApiError::InvalidRequest(
            "invalid or expired pair_token".to_string(),
        ));
    };

    let (device, workspace) =
        pairing::complete_pairing(state.store.as_ref(), claim, body.platform, &body.push_token)
            .await
            .map_err(ApiError::from_store)?;

    Ok(Json(PairCompleteResponse {
        device_id: device.id,
        bridge_secret: workspace.bridge_secret,
        workspace_id: workspace.id,
    }))
}

fn empty_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Deserialize)]
struct BridgeEventBody {
    workspace_id: String,
    run_id: String,
    provider: String,
    event_type: String,
    event_ts: DateTime<Utc>,
    #[serde(default = "empty_payload")]
    payload: Value,
}

#[derive(Debug, Serialize)]
struct StatusOkResponse {
    status: &'static str,
}

async fn ingest_bridge_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusOkResponse>, ApiError> {
    let (raw, body): (Value, BridgeEventBody) = parse_body(&body)?;
    require_non_empty("workspace_id", &body.workspace_id)?;
    require_non_empty("run_id", &body.run_id)?;
    require_non_empty("provider", &body.provider)?;
    require_non_empty("event_type", &body.event_type)?;

    let signature_headers = SignatureHeaders::from_headers(&headers);
    let secret = resolve_bridge_secret(&state, Some(body.workspace_id.as_str())).await?;
    state
        .authenticator
        .verify(secret.as_deref(), &signature_headers, Some(&raw))
        .await
        .map_err(ApiError::Unauthorized)?;

    runs::ingest(
        state.store.as_ref(),
        RunEventInput {
            run_id: body.run_id,
            workspace_id: body.workspace_id,
            provider: body.provider,
            event_type: body.event_type,
            event_ts: body.event_ts,
            payload: body.payload,
        },
    )
    .await
    .map_err(ApiError::from_store)?;

    Ok(Json(StatusOkResponse { status: "ok" }))
}

#[derive(Debug, Deserialize)]
struct ApprovalRequestBody {
    run_id: String,
    command: String,
    cwd: String,
    #[serde(default = "empty_payload")]
    context: Value,
    workspace_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApprovalRequestedResponse {
    approval_id: String,
}

fn workspace_id_from_context(context: &Value) -> Option<String> {
    ["workspace_id", "workspaceId"]
        .iter()
        .find_map(|key| context.get(key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn request_approval(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApprovalRequestedResponse>, ApiError> {
    let (raw, body): (Value, ApprovalRequestBody) = parse_body(&body)?;
    require_non_empty("run_id", &body.run_id)?;
    require_non_empty("command", &body.command)?;
    require_non_empty("cwd", &body.cwd)?;

    // The caller may name its workspace directly, tuck it into the free-form
    // context, rely on the run record it reported earlier, or fall back to
    // the workspace header.
    let signature_headers = SignatureHeaders::from_headers(&headers);
    let run = state
        .store
        .get_run(&body.run_id)
        .await
        .map_err(ApiError::from_store)?;
    let workspace_id = body
        .workspace_id
        .clone()
        .or_else(|| workspace_id_from_context(&body.context))
        .or_else(|| run.map(|run| run.workspace_id))
        .or_else(|| signature_headers.workspace_id.clone());
    let secret = resolve_bridge_secret(&state, workspace_id.as_deref()).await?;
    state
        .authenticator
        .verify(secret.as_deref(), &signature_headers, Some(&raw))
        .await
        .map_err(ApiError::Unauthorized)?;

    let approval = state
        .store
        .create_approval(approvals::new_command_approval(
            &body.run_id,
            &body.command,
            &body.cwd,
        ))
        .await
        .map_err(ApiError::from_store)?;

    notify_owning_device(&state, workspace_id.as_deref(), &approval).await;

    Ok(Json(ApprovalRequestedResponse {
        approval_id: approval.id,
    }))
}

/// Best-effort push to the device that owns the workspace. Anything that
/// fails to resolve skips the notification; the approval itself is already
/// durable at this point.
async fn notify_owning_device(state: &AppState, workspace_id: Option<&str>, approval: &Approval) {
    let Some(workspace_id) = workspace_id else {
        return;
    };
    let workspace = match state.store.get_workspace(workspace_id).await {
        Ok(Some(workspace)) => workspace,
        Ok(None) => return,
        Err(error) => {
            warn!(reason = %error, "workspace lookup for push failed");
            return;
        }
    };
    let device = match state.store.get_device(&workspace.device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => return,
        Err(error) => {
            warn!(reason = %error, "device lookup for push failed");
            return;
        }
    };

    state
        .push
        .send(
            &device,
            PushNotification {
                title: "Approval Requested".to_string(),
                body: approval.command.clone(),
                data: BTreeMap::from([
                    ("approval_id".to_string(), approval.id.clone()),
                    ("run_id".to_string(), approval.run_id.clone()),
                ]),
            },
        )
        .await;
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout: Option<String>,
}

#[derive(Debug, Serialize)]
struct DecisionStatusResponse {
    status: ApprovalStatus,
    note: Option<String>,
}

async fn wait_for_decision(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Query(query): Query<WaitQuery>,
    headers: HeaderMap,
) -> Result<Json<DecisionStatusResponse>, ApiError> {
    let Some(approval) = state
        .store
        .get_approval(&approval_id)
        .await
        .map_err(ApiError::from_store)?
    else {
        return Err(ApiError::NotFound);
    };

    // The wait call is signed over an empty body; its workspace comes from
    // the run the approval belongs to, or the workspace header.
    let signature_headers = SignatureHeaders::from_headers(&headers);
    let run = state
        .store
        .get_run(&approval.run_id)
        .await
        .map_err(ApiError::from_store)?;
    let workspace_id = run
        .map(|run| run.workspace_id)
        .or_else(|| signature_headers.workspace_id.clone());
    let secret = resolve_bridge_secret(&state, workspace_id.as_deref()).await?;
    state
        .authenticator
        .verify(secret.as_deref(), &signature_headers, None)
        .await
        .map_err(ApiError::Unauthorized)?;

    // A decision committed before this call must be observed immediately;
    // only a genuinely pending approval suspends the caller.
    if approval.status.is_terminal() {
        return Ok(Json(DecisionStatusResponse {
            status: approval.status,
            note: approval.note,
        }));
    }

    let timeout = state.config.wait_timeout(query.timeout.as_deref());
    match state.waiters.wait(&approval_id, timeout).await {
        Some(decided) => Ok(Json(DecisionStatusResponse {
            status: decided.status,
            note: decided.note,
        })),
        None => Ok(Json(DecisionStatusResponse {
            status: ApprovalStatus::Pending,
            note: None,
        })),
    }
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
    decision: ApprovalDecision,
    note: Option<String>,
}

async fn post_decision(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DecisionStatusResponse>, ApiError> {
    let (_, body): (Value, DecisionBody) = parse_body(&body)?;

    let decided_by_device_id = headers
        .get("x-device-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let outcome = approvals::decide(
        state.store.as_ref(),
        &state.waiters,
        DecideApproval {
            approval_id,
            decision: body.decision,
            note: body.note,
            decided_by_device_id,
        },
    )
    .await
    .map_err(ApiError::from_store)?;

    let Some(outcome) = outcome else {
        return Err(ApiError::NotFound);
    };

    Ok(Json(DecisionStatusResponse {
        status: outcome.status,
        note: outcome.note,
    }))
}

/// Resolves the signing secret for a request: the workspace's own bridge
/// secret when the workspace is known, otherwise the process-wide default.
async fn resolve_bridge_secret(
    state: &AppState,
    workspace_id: Option<&str>,
) -> Result<Option<String>, ApiError> {
    if let Some(workspace_id) = workspace_id {
        if let Some(workspace) = state
            .store
            .get_workspace(workspace_id)
            .await
            .map_err(ApiError::from_store)?
        {
            return Ok(Some(workspace.bridge_secret));
        }
    }
    Ok(state.config.default_bridge_secret.clone())
}

fn parse_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<(Value, T), ApiError> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|_| ApiError::InvalidRequest("request body must be JSON".to_string()))?;
    let parsed = serde_json::from_value(raw.clone())
        .map_err(|error| ApiError::InvalidRequest(format!("invalid request body: {error}")))?;
    Ok((raw, parsed))
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidRequest(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    Unauthorized(AuthError),
    InvalidRequest(String),
    Internal(String),
}

impl ApiError {
    fn from_store(error: StoreError) -> Self {
        Self::Internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Unauthorized(auth) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": auth.to_string(),
                    "reason_code": auth.code(),
                })),
            )
                .into_response(),
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}
