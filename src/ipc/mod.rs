//! HTTP control API over the orchestrator.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::manifest::ToolDescriptor;
use crate::orchestrator::ToolOrchestrator;

/// `GET /api/tool/:id/logs` 기본 줄 수
const DEFAULT_LOG_COUNT: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Only lines with a greater id; takes precedence over `count`.
    pub since: Option<u64>,
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRestartSetting {
    pub enabled: bool,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub orchestrator: ToolOrchestrator,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(orchestrator: ToolOrchestrator, listen_addr: &str) -> Self {
        Self {
            orchestrator,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/tools", get(list_tools).post(install_tool))
            .route("/api/tools/available", get(list_available))
            .route("/api/tool/:id", delete(uninstall_tool))
            .route("/api/tool/:id/start", post(start_tool))
            .route("/api/tool/:id/stop", post(stop_tool))
            .route("/api/tool/:id/restart", post(restart_tool))
            .route("/api/tool/:id/status", get(tool_status))
            .route("/api/tool/:id/logs", get(tool_logs))
            .route("/api/status", get(all_statuses))
            .route("/api/manifests", put(save_manifest))
            .route("/api/manifest/:id", delete(delete_manifest))
            .route(
                "/api/settings/auto-restart",
                get(get_auto_restart).put(set_auto_restart),
            )
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("IPC server stopped");
        Ok(())
    }
}

/// GET /api/tools - 카탈로그 (설치 여부 + 상태 포함)
async fn list_tools(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(json!({ "tools": state.orchestrator.catalog() }))
}

/// GET /api/tools/available - 아직 설치되지 않은 도구
async fn list_available(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(json!({ "tools": state.orchestrator.available_to_install() }))
}

/// POST /api/tools - 도구 설치
async fn install_tool(
    State(state): State<IPCServer>,
    Json(descriptor): Json<ToolDescriptor>,
) -> impl IntoResponse {
    match state.orchestrator.install(&descriptor).await {
        Ok(outcome) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "tool_id": descriptor.id,
                "outcome": outcome,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Install of '{}' failed: {}", descriptor.id, e);
            e.into_response()
        }
    }
}

/// DELETE /api/tool/:id - 도구 제거 (실행 중이면 먼저 중지)
async fn uninstall_tool(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.uninstall(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "tool_id": id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/tool/:id/start
async fn start_tool(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.start(&id).await {
        Ok(instance) => {
            (StatusCode::OK, Json(json!({ "success": true, "instance": instance }))).into_response()
        }
        Err(e) => {
            tracing::warn!("Start of '{}' failed: {}", id, e);
            e.into_response()
        }
    }
}

/// POST /api/tool/:id/stop - 실행 중이 아니어도 성공
async fn stop_tool(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.stop(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "tool_id": id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/tool/:id/restart
async fn restart_tool(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.restart(&id).await {
        Ok(instance) => {
            (StatusCode::OK, Json(json!({ "success": true, "instance": instance }))).into_response()
        }
        Err(e) => {
            tracing::warn!("Restart of '{}' failed: {}", id, e);
            e.into_response()
        }
    }
}

/// GET /api/tool/:id/status
async fn tool_status(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.status(&id) {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/tool/:id/logs?since=N | ?count=N
async fn tool_logs(
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    State(state): State<IPCServer>,
) -> impl IntoResponse {
    let lines = match query.since {
        Some(since) => state.orchestrator.logs_since(&id, since),
        None => state
            .orchestrator
            .logs(&id, query.count.unwrap_or(DEFAULT_LOG_COUNT)),
    };
    Json(json!({ "tool_id": id, "lines": lines }))
}

/// GET /api/status - 모든 인스턴스 상태
async fn all_statuses(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(json!({ "instances": state.orchestrator.statuses() }))
}

/// PUT /api/manifests - 사용자 매니페스트 저장 (같은 id는 덮어씀)
async fn save_manifest(
    State(state): State<IPCServer>,
    Json(descriptor): Json<ToolDescriptor>,
) -> impl IntoResponse {
    match state.orchestrator.save_manifest(&descriptor) {
        Ok(()) => {
            (StatusCode::OK, Json(json!({ "success": true, "tool_id": descriptor.id }))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/manifest/:id
async fn delete_manifest(Path(id): Path<String>, State(state): State<IPCServer>) -> impl IntoResponse {
    match state.orchestrator.delete_manifest(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "tool_id": id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_auto_restart(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(AutoRestartSetting {
        enabled: state.orchestrator.auto_restart(),
    })
}

async fn set_auto_restart(
    State(state): State<IPCServer>,
    Json(setting): Json<AutoRestartSetting>,
) -> impl IntoResponse {
    state.orchestrator.set_auto_restart(setting.enabled);
    Json(setting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installed::InstalledTools;
    use crate::manifest::tests::descriptor_with_port;
    use crate::orchestrator::tests::fixture;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn server() -> (IPCServer, crate::orchestrator::tests::Fixture) {
        let f = fixture();
        (IPCServer::new(f.orchestrator.clone(), "127.0.0.1:0"), f)
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let (server, _f) = server();
        let (status, body) = call(server.router(), Method::GET, "/api/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"], json!([]));

        let (status, body) = call(server.router(), Method::GET, "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instances"], json!([]));
    }

    #[tokio::test]
    async fn test_manifest_save_then_available() {
        let (server, _f) = server();
        let desc = serde_json::to_value(descriptor_with_port("alpha", 18001)).unwrap();

        let (status, body) = call(server.router(), Method::PUT, "/api/manifests", Some(desc)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (_, body) = call(server.router(), Method::GET, "/api/tools/available", None).await;
        assert_eq!(body["tools"][0]["id"], "alpha");

        let (_, body) = call(server.router(), Method::GET, "/api/tool/alpha/status", None).await;
        assert_eq!(body["status"], "stopped");

        let (status, _) = call(server.router(), Method::DELETE, "/api/manifest/alpha", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(server.router(), Method::DELETE, "/api/manifest/alpha", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "MANIFEST_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_manifest_is_bad_request() {
        let (server, _f) = server();
        let mut desc = serde_json::to_value(descriptor_with_port("alpha", 18001)).unwrap();
        desc["start"]["port"] = Value::Null;

        let (status, body) = call(server.router(), Method::PUT, "/api/manifests", Some(desc.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error_code"], "INVALID_DESCRIPTOR");

        let (status, _) = call(server.router(), Method::POST, "/api/tools", Some(desc)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_manifest_stays_inside_user_dir() {
        let (server, f) = server();
        f.installed.add(descriptor_with_port("kept", 18002)).unwrap();
        let state = f.tmp.path().join("installed.json");
        assert!(state.exists());

        let (status, body) =
            call(server.router(), Method::DELETE, "/api/manifest/..%2Finstalled", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_DESCRIPTOR");
        assert!(state.exists());
    }

    #[tokio::test]
    async fn test_unknown_tool_routes() {
        let (server, _f) = server();

        let (status, body) = call(server.router(), Method::GET, "/api/tool/ghost/status", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "MANIFEST_NOT_FOUND");

        let (status, _) = call(server.router(), Method::POST, "/api/tool/ghost/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(server.router(), Method::DELETE, "/api/tool/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // stop 은 no-op
        let (status, body) = call(server.router(), Method::POST, "/api/tool/ghost/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = call(server.router(), Method::GET, "/api/tool/ghost/logs?count=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lines"], json!([]));
    }

    #[tokio::test]
    async fn test_auto_restart_setting() {
        let (server, _f) = server();
        let (_, body) = call(server.router(), Method::GET, "/api/settings/auto-restart", None).await;
        assert_eq!(body["enabled"], false);

        let (status, body) = call(
            server.router(),
            Method::PUT,
            "/api/settings/auto-restart",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert!(server.orchestrator.auto_restart());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_and_uninstall() {
        let (server, f) = server();
        let mut desc = descriptor_with_port("lab", 18789);
        desc.install.command = "true".into();
        let body = serde_json::to_value(&desc).unwrap();

        let (status, resp) = call(server.router(), Method::POST, "/api/tools", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED, "{}", resp);
        assert_eq!(resp["outcome"], "installed");

        let (status, resp) = call(server.router(), Method::POST, "/api/tools", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(resp["error_code"], "ALREADY_INSTALLED");

        let (_, resp) = call(server.router(), Method::GET, "/api/tools", None).await;
        assert_eq!(resp["tools"][0]["installed"], true);

        let (status, _) = call(server.router(), Method::DELETE, "/api/tool/lab", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!f.installed.is_installed("lab"));
    }
}
