//! The control RPC/HTTP surface (§6 "process boundary") used by external
//! collaborators (tray, dashboard) that are otherwise out of scope for
//! THE CORE. Every route maps 1:1 onto an [`UpstreamManager`] operation
//! (§4.1) — the wire shape here is deliberately thin; ranking, search,
//! and OAuth redirect UI are the collaborators' concern, not the core's.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;
use crate::manager::{ServerStatus, UiBucket, UpstreamManager};

#[derive(Clone)]
pub struct ControlState {
    pub manager: Arc<UpstreamManager>,
}

pub fn router(manager: Arc<UpstreamManager>) -> Router {
    Router::new()
        .route("/servers", get(list_servers))
        .route("/reconnect-all", post(reconnect_all))
        .route("/servers/{name}/enable", post(enable_server))
        .route("/servers/{name}/quarantine", post(quarantine))
        .route("/servers/{name}/stop", post(stop_upstream))
        .route("/servers/{name}/unstop", post(unstop))
        .route("/servers/{name}/restart", post(restart_upstream))
        .route("/servers/{name}/group", post(set_group))
        .route("/servers/{name}/oauth-login", post(oauth_login))
        .route("/servers/{name}/tools", get(get_tools))
        .route("/servers/{name}/call/{tool}", post(call_tool))
        .with_state(ControlState { manager })
}

#[derive(Serialize)]
struct ServerStatusDto {
    name: String,
    startup_mode: String,
    connection_state: String,
    bucket: String,
    tool_count: usize,
    last_error: Option<String>,
}

impl From<ServerStatus> for ServerStatusDto {
    fn from(s: ServerStatus) -> Self {
        Self {
            name: s.name,
            startup_mode: format!("{:?}", s.startup_mode),
            connection_state: format!("{:?}", s.connection_state),
            bucket: bucket_label(s.bucket).to_string(),
            tool_count: s.tool_count,
            last_error: s.last_error,
        }
    }
}

fn bucket_label(bucket: UiBucket) -> &'static str {
    match bucket {
        UiBucket::Connected => "connected",
        UiBucket::Connecting => "connecting",
        UiBucket::Sleeping => "sleeping",
        UiBucket::Stopped => "stopped",
        UiBucket::Disabled => "disabled",
        UiBucket::Quarantined => "quarantined",
        UiBucket::AutoDisabled => "auto_disabled",
    }
}

fn error_status(e: &ProxyError) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match e {
        ProxyError::UnknownServer(_) => StatusCode::NOT_FOUND,
        ProxyError::NotReady(_) | ProxyError::Quarantined(_) => StatusCode::CONFLICT,
        ProxyError::Validation(_) | ProxyError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
        ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_response<T: Serialize>(result: Result<T, ProxyError>) -> axum::response::Response {
    use axum::response::IntoResponse;
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => (error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn list_servers(State(state): State<ControlState>) -> Json<Vec<ServerStatusDto>> {
    let statuses = state.manager.list_servers().await;
    Json(statuses.into_iter().map(ServerStatusDto::from).collect())
}

#[derive(Serialize)]
struct SchedulerResultDto {
    duration_ms: u64,
    total_jobs: usize,
    successful: usize,
    failed: usize,
    retried: usize,
}

impl From<crate::scheduler::SchedulerResult> for SchedulerResultDto {
    fn from(r: crate::scheduler::SchedulerResult) -> Self {
        Self {
            duration_ms: r.duration_ms,
            total_jobs: r.total_jobs,
            successful: r.successful,
            failed: r.failed,
            retried: r.retried,
        }
    }
}

/// "Reconnect everything" — bring up every client currently eligible for
/// bring-up under the scheduler's concurrency cap, outside the normal
/// reconcile-triggered wave (e.g. an operator retrying after fixing a
/// shared outage).
async fn reconnect_all(State(state): State<ControlState>) -> Json<SchedulerResultDto> {
    Json(state.manager.bring_up_all().await.into())
}

#[derive(Deserialize)]
struct EnableBody {
    enabled: bool,
}

async fn enable_server(
    State(state): State<ControlState>,
    Path(name): Path<String>,
    Json(body): Json<EnableBody>,
) -> axum::response::Response {
    to_response(state.manager.enable_server(&name, body.enabled).await)
}

#[derive(Deserialize)]
struct QuarantineBody {
    quarantined: bool,
}

async fn quarantine(
    State(state): State<ControlState>,
    Path(name): Path<String>,
    Json(body): Json<QuarantineBody>,
) -> axum::response::Response {
    to_response(state.manager.quarantine(&name, body.quarantined).await)
}

async fn stop_upstream(State(state): State<ControlState>, Path(name): Path<String>) -> axum::response::Response {
    to_response(state.manager.stop_upstream(&name).await)
}

async fn unstop(State(state): State<ControlState>, Path(name): Path<String>) -> axum::response::Response {
    to_response(state.manager.unstop(&name).await)
}

async fn restart_upstream(State(state): State<ControlState>, Path(name): Path<String>) -> axum::response::Response {
    to_response(state.manager.restart_upstream(&name).await)
}

#[derive(Deserialize)]
struct SetGroupBody {
    group_id: Option<i64>,
}

async fn set_group(
    State(state): State<ControlState>,
    Path(name): Path<String>,
    Json(body): Json<SetGroupBody>,
) -> axum::response::Response {
    to_response(state.manager.set_group(&name, body.group_id).await)
}

async fn oauth_login(State(state): State<ControlState>, Path(name): Path<String>) -> axum::response::Response {
    to_response(state.manager.oauth_login(&name).await)
}

async fn get_tools(State(state): State<ControlState>, Path(name): Path<String>) -> axum::response::Response {
    to_response(state.manager.get_tools(&name).await)
}

async fn call_tool(
    State(state): State<ControlState>,
    Path((name, tool)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> axum::response::Response {
    let args = body.map(|Json(v)| v).unwrap_or_else(|| serde_json::json!({}));
    to_response(state.manager.call_tool(&name, &tool, args).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, ProxyConfig, Server, StartupMode};
    use crate::events::EventBus;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::store::kv::{KvStore, UpstreamRecord};
    use crate::store::Persistence;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn server(name: &str) -> Server {
        Server {
            name: name.to_string(),
            protocol: Protocol::Stdio,
            command: Some("true".to_string()),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            oauth: None,
            startup_mode: StartupMode::Active,
            group_id: None,
            group_name: None,
            repository_url: None,
            isolation: None,
            auto_disable_threshold: None,
            enabled: None,
            stopped: None,
            quarantined: None,
            auto_disabled: None,
        }
    }

    async fn test_app() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::temporary().unwrap();
        kv.put(&UpstreamRecord::new("s1", StartupMode::Active)).unwrap();
        let mut config = ProxyConfig::default();
        config.mcp_servers.push(server("s1"));
        let path = dir.path().join("mcpproxy.json");
        std::mem::forget(dir);
        let persistence = Persistence::new(kv, ProxyConfig::default(), path, EventBus::new());
        let scheduler = Scheduler::new(SchedulerConfig::with_workers(2));
        let manager = UpstreamManager::new(persistence, scheduler, 5, false);
        manager.reconcile(&config).await.unwrap();
        router(manager)
    }

    #[tokio::test]
    async fn list_servers_returns_known_server() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn stop_unknown_server_returns_404() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/servers/ghost/stop")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_group_on_unknown_server_returns_404() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/servers/ghost/group")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"group_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reconnect_all_returns_scheduler_result() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/reconnect-all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn enable_server_toggles_startup_mode() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/servers/s1/enable")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"enabled": false}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
