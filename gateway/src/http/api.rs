//! JSON API and the browser entry point.

use core::{error::Error, net::SocketAddr};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::{
    app::{ActivityOutcome, AppState, EngineError, WakeOutcome},
    config::{ConfigSnapshot, DomainConfig, EngineSettings, Policy, PolicyKind, ProbeMethod, UnknownDomain},
    http::caller::CallerIp,
};

/// Log entries returned when no `limit` is given.
const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

/// Routes available to every caller permitted by the domain's allow-list.
pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/status/{domain}", get(status))
        .route("/wake/{domain}", post(wake))
        .route("/activity/{domain}", post(activity))
}

/// Routes guarded by `[server] admin_allowlist`.
pub(crate) fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/reset/{domain}", post(reset))
        .route("/reload", post(reload))
        .route("/domains", get(domains))
        .route("/config", get(config))
        .route("/logs", get(logs))
}

fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let code = match self {
            Self::UnknownDomain(_) => StatusCode::NOT_FOUND,
            Self::AccessDenied { .. } => StatusCode::FORBIDDEN,
        };
        (code, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for UnknownDomain {
    fn into_response(self) -> Response {
        EngineError::from(self).into_response()
    }
}

async fn status(
    Path(domain): Path<String>,
    State(state): State<AppState>,
    CallerIp(caller): CallerIp,
) -> Response {
    match state.engine.status(&domain, caller).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn wake(
    Path(domain): Path<String>,
    State(state): State<AppState>,
    CallerIp(caller): CallerIp,
) -> Response {
    match state.engine.wake(&domain, caller).await {
        Ok(outcome) => {
            let code = match outcome {
                WakeOutcome::Accepted => StatusCode::ACCEPTED,
                WakeOutcome::AlreadyInFlight | WakeOutcome::AlreadyAwake => StatusCode::OK,
                WakeOutcome::CoolingDown | WakeOutcome::WakeDisabled => StatusCode::CONFLICT,
            };
            (code, Json(json!({ "result": outcome }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn activity(
    Path(domain): Path<String>,
    State(state): State<AppState>,
    CallerIp(caller): CallerIp,
) -> Response {
    match state.engine.activity(&domain, caller).await {
        Ok(outcome) => {
            let code = match outcome {
                ActivityOutcome::Accepted => StatusCode::OK,
                ActivityOutcome::Denied => StatusCode::FORBIDDEN,
            };
            (code, Json(json!({ "result": outcome }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Browser entry point: counts as activity, then redirects once the domain is running.
///
/// Until then answers `503` with `Retry-After` and the status so a waiting page can poll.
pub(crate) async fn entry(
    Path(domain): Path<String>,
    State(state): State<AppState>,
    CallerIp(caller): CallerIp,
) -> Response {
    let status = match state.engine.entry(&domain, caller).await {
        Ok(status) => status,
        Err(e) => return e.into_response(),
    };
    if let Some(url) = status.redirect_url.clone() {
        return Redirect::temporary(&url).into_response();
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(RETRY_AFTER, status.poll_interval_seconds.to_string())],
        Json(status),
    )
        .into_response()
}

async fn reset(Path(domain): Path<String>, State(state): State<AppState>) -> Response {
    match state.engine.reset(&domain).await {
        Ok(outcome) => Json(json!({ "result": outcome })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn reload(State(state): State<AppState>) -> Response {
    match state.engine.reload().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "config_error", "details": error_chain(&e) })),
        )
            .into_response(),
    }
}

async fn domains(State(state): State<AppState>) -> Response {
    Json(state.engine.statuses().await).into_response()
}

async fn config(State(state): State<AppState>) -> Response {
    let snapshot = state.engine.config();
    Json(ConfigView::new(&snapshot, &state.config_path)).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.engine.recent_events(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!(error = %error_chain(&e), "Failed to read event log");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "event log unavailable" })),
            )
                .into_response()
        }
    }
}

/// Configuration as shown to admins. Shared secrets are never included.
#[derive(Debug, Serialize)]
struct ConfigView<'a> {
    version: u64,
    config_path: &'a std::path::Path,
    server: ServerView,
    engine: &'a EngineSettings,
    db_enabled: bool,
    domains: Vec<DomainView<'a>>,
}

#[derive(Debug, Serialize)]
struct ServerView {
    port: u16,
    bind: String,
    trust_forwarded_for: bool,
    admin_allowlist: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WindowView {
    days: Vec<String>,
    start: String,
    end: String,
}

#[derive(Debug, Serialize)]
struct ShutdownView {
    port: u16,
    signed: bool,
}

#[derive(Debug, Serialize)]
struct DomainView<'a> {
    id: &'a str,
    description: Option<&'a str>,
    host_address: &'a str,
    hardware_address: String,
    policy: PolicyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    timezone: Option<String>,
    schedule: Vec<WindowView>,
    wake_timeout_seconds: u64,
    idle_shutdown_minutes: u64,
    boot_timeout_seconds: Option<u64>,
    health_check_url: Option<&'a str>,
    redirect_url: &'a str,
    allowlist: Vec<String>,
    wake_enabled: bool,
    wake_target: SocketAddr,
    probe_port: Option<u16>,
    shutdown: Option<ShutdownView>,
}

impl<'a> ConfigView<'a> {
    fn new(snapshot: &'a ConfigSnapshot, config_path: &'a std::path::Path) -> Self {
        Self {
            version: snapshot.version,
            config_path,
            server: ServerView {
                port: snapshot.server.port,
                bind: snapshot.server.bind.to_string(),
                trust_forwarded_for: snapshot.server.trust_forwarded_for,
                admin_allowlist: snapshot
                    .server
                    .admin_allowlist
                    .entries()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
            engine: &snapshot.engine,
            db_enabled: snapshot.db.as_ref().is_some_and(|db| db.enable),
            domains: snapshot.domains.values().map(|d| DomainView::new(d)).collect(),
        }
    }
}

impl<'a> DomainView<'a> {
    fn new(domain: &'a DomainConfig) -> Self {
        let (timezone, schedule) = match domain.policy {
            Policy::Scheduled(ref schedule) => (
                Some(schedule.timezone.name().to_string()),
                schedule
                    .windows
                    .iter()
                    .map(|w| WindowView {
                        days: w.days.iter().map(|d| d.to_string()).collect(),
                        start: w.start.to_string(),
                        end: w.end.to_string(),
                    })
                    .collect(),
            ),
            Policy::AlwaysOn | Policy::OnDemand => (None, Vec::new()),
        };
        Self {
            id: &domain.id,
            description: domain.description.as_deref(),
            host_address: &domain.host_address,
            hardware_address: domain.hardware_address.to_string(),
            policy: domain.policy.kind(),
            timezone,
            schedule,
            wake_timeout_seconds: domain.wake_timeout.as_secs(),
            idle_shutdown_minutes: domain.idle_shutdown.as_secs() / 60,
            boot_timeout_seconds: domain.boot_timeout.map(|t| t.as_secs()),
            health_check_url: domain.health_check.as_ref().map(|h| h.url.as_str()),
            redirect_url: domain.redirect_url.as_str(),
            allowlist: domain
                .allowlist
                .entries()
                .iter()
                .map(ToString::to_string)
                .collect(),
            wake_enabled: domain.wake_enabled,
            wake_target: domain.wake_target,
            probe_port: match domain.probe {
                ProbeMethod::Tcp(port) => Some(port),
                ProbeMethod::Icmp => None,
            },
            shutdown: domain.shutdown.as_ref().map(|s| ShutdownView {
                port: s.port,
                signed: s.shared_secret.is_some(),
            }),
        }
    }
}
