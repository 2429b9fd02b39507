//! HTTP control API using Axum: one route per lifecycle verb.
//!
//! Admin verbs are authorized here, against a bearer token, before they
//! reach the lifecycle core; the core never re-checks caller privilege.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use crate::lifecycle::{self, LifecycleError, TeardownReason};
use crate::notify::{AuditEvent, Severity};
use crate::state::AppState;

#[derive(Deserialize)]
struct StartLabRequest {
    owner: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Serialize)]
struct LabCreatedResponse {
    owner: String,
    port: u16,
    url: String,
    username: &'static str,
    password: String,
    expires_in_secs: u64,
}

#[derive(Serialize)]
struct LabStatusResponse {
    owner: String,
    display_name: String,
    port: u16,
    remaining_secs: u64,
}

#[derive(Serialize)]
struct StopResponse {
    owner: String,
    stopped: bool,
}

#[derive(Deserialize)]
struct BanRequest {
    #[serde(default = "default_ban_reason")]
    reason: String,
}

fn default_ban_reason() -> String {
    "dangerous behavior".to_string()
}

#[derive(Serialize)]
struct BanResponse {
    owner: String,
    reason: String,
    had_active_lab: bool,
}

#[derive(Serialize)]
struct HistoryResponse {
    owner: String,
    history: String,
}

/// Stable error body: the front end renders one message per `error` kind
/// without inspecting free text.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn status_for(kind: &str) -> StatusCode {
    match kind {
        "denied" => StatusCode::FORBIDDEN,
        "already-active" => StatusCode::CONFLICT,
        "capacity-exhausted" | "ports-exhausted" => StatusCode::SERVICE_UNAVAILABLE,
        "not-found" => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn lifecycle_error(err: LifecycleError) -> ApiError {
    let kind = err.kind();
    (
        status_for(kind),
        Json(ErrorBody {
            error: kind,
            message: err.to_string(),
        }),
    )
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not-found",
            message: message.to_string(),
        }),
    )
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let denied = |message: &str| {
        (
            StatusCode::FORBIDDEN,
            Json(ErrorBody {
                error: "denied",
                message: message.to_string(),
            }),
        )
    };

    let expected = state
        .config
        .admin_token
        .as_deref()
        .ok_or_else(|| denied("admin access is not configured"))?;

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(()),
        _ => Err(denied("admin token required")),
    }
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let app = Router::new()
        // User verbs
        .route("/labs", post(start_lab))
        .route("/labs/:owner", get(lab_status))
        .route("/labs/:owner", delete(stop_lab))
        // Admin verbs
        .route("/labs", get(list_labs))
        .route("/admin/labs/:owner/nuke", post(nuke_lab))
        .route("/admin/labs/:owner/history", get(lab_history))
        .route("/admin/bans", get(list_bans))
        .route("/admin/bans/:owner", put(ban_owner))
        .route("/admin/bans/:owner", delete(unban_owner))
        // Health check
        .route("/health", get(health))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "OK"
}

async fn start_lab(
    State(state): State<AppState>,
    Json(req): Json<StartLabRequest>,
) -> Result<(StatusCode, Json<LabCreatedResponse>), ApiError> {
    let display_name = req.display_name.unwrap_or_else(|| req.owner.clone());
    let provisioned = lifecycle::provision(&state, &req.owner, &display_name)
        .await
        .map_err(lifecycle_error)?;

    Ok((
        StatusCode::CREATED,
        Json(LabCreatedResponse {
            owner: req.owner,
            port: provisioned.port,
            url: provisioned.url,
            username: "student",
            password: provisioned.secret,
            expires_in_secs: provisioned.expires_in_secs,
        }),
    ))
}

async fn lab_status(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<LabStatusResponse>, ApiError> {
    let remaining = lifecycle::remaining_time(&state, &owner)
        .await
        .ok_or_else(|| not_found("no active lab for this owner"))?;

    let sessions = state.sessions.read().await;
    let session = sessions
        .get(&owner)
        .ok_or_else(|| not_found("no active lab for this owner"))?;

    Ok(Json(LabStatusResponse {
        owner: session.owner.clone(),
        display_name: session.display_name.clone(),
        port: session.port,
        remaining_secs: remaining.as_secs(),
    }))
}

async fn stop_lab(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let diag = lifecycle::teardown(&state, &owner, TeardownReason::UserRequested)
        .await
        .map_err(lifecycle_error)?;

    state.audit.send(lifecycle::teardown_event(&diag)).await;
    Ok(Json(StopResponse {
        owner: diag.owner,
        stopped: true,
    }))
}

async fn list_labs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<LabStatusResponse>>, ApiError> {
    require_admin(&state, &headers)?;

    let full = std::time::Duration::from_secs(state.config.session_secs);
    let sessions = state.sessions.read().await;
    let list: Vec<LabStatusResponse> = sessions
        .values()
        .map(|s| LabStatusResponse {
            owner: s.owner.clone(),
            display_name: s.display_name.clone(),
            port: s.port,
            remaining_secs: full.saturating_sub(s.started_at.elapsed()).as_secs(),
        })
        .collect();
    Ok(Json(list))
}

async fn nuke_lab(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StopResponse>, ApiError> {
    require_admin(&state, &headers)?;

    // Force paths always leave an audit trail, success or not: these events
    // are the operator's only view into abnormal termination.
    match lifecycle::teardown(&state, &owner, TeardownReason::AdminForced).await {
        Ok(diag) => {
            state.audit.send(lifecycle::teardown_event(&diag)).await;
            Ok(Json(StopResponse {
                owner,
                stopped: true,
            }))
        }
        Err(err) => {
            state
                .audit
                .send(AuditEvent::new(
                    "Admin force stop",
                    format!("force stop of {} failed: {}", owner, err),
                    Severity::Urgent,
                ))
                .await;
            Err(lifecycle_error(err))
        }
    }
}

async fn lab_history(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let handle = {
        let sessions = state.sessions.read().await;
        sessions
            .get(&owner)
            .map(|s| s.handle.clone())
            .ok_or_else(|| not_found("no active lab for this owner"))?
    };

    let history = lifecycle::fetch_history(&state, &handle).await;
    Ok(Json(HistoryResponse { owner, history }))
}

async fn list_bans(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<std::collections::HashMap<String, String>>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.bans.all().await))
}

async fn ban_owner(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BanRequest>,
) -> Result<Json<BanResponse>, ApiError> {
    require_admin(&state, &headers)?;

    let diag = lifecycle::ban_owner(&state, &owner, &req.reason).await;
    Ok(Json(BanResponse {
        owner,
        reason: req.reason,
        had_active_lab: diag.is_some(),
    }))
}

async fn unban_owner(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;

    if lifecycle::unban_owner(&state, &owner).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("this owner is not banned"))
    }
}
