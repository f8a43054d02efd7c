//! The orchestrator's HTTP and WebSocket surface.

use crate::error::NodeError;
use crate::metrics::RelayMetrics;
use crate::orchestrator::Orchestrator;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use relay_router::RouterEvent;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Interval between server pings on the dashboard WebSocket.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator.
    pub orchestrator: Arc<Orchestrator>,
    /// The metric registry.
    pub metrics: Arc<RelayMetrics>,
}

/// Builds the HTTP router.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/metrics", get(metrics))
        .route("/workspaces", get(list_workspaces).post(add_workspace))
        .route(
            "/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/workspaces/{id}/switch", post(switch_workspace))
        .route(
            "/workspaces/{id}/agents",
            get(list_agents).post(spawn_agent),
        )
        .route("/workspaces/{id}/agents/{name}", axum::routing::delete(stop_agent))
        .route("/ws", get(ws_dashboard))
        .route("/agents/ws", get(ws_agent))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(error: &NodeError) -> Response {
    let status = match error {
        NodeError::UnknownWorkspace(_) => StatusCode::NOT_FOUND,
        NodeError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn list_workspaces(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "workspaces": state.orchestrator.workspaces(),
        "activeWorkspaceId": state.orchestrator.active_workspace_id(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddWorkspaceBody {
    name: String,
    path: String,
}

async fn add_workspace(
    State(state): State<AppState>,
    Json(body): Json<AddWorkspaceBody>,
) -> Response {
    if body.name.trim().is_empty() || body.path.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name and path are required" })),
        )
            .into_response();
    }
    match state
        .orchestrator
        .add_workspace(&body.name, std::path::Path::new(&body.path))
    {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get(&id) {
        Some(record) => Json(record).into_response(),
        None => error_response(&NodeError::UnknownWorkspace(id)),
    }
}

async fn delete_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.remove_workspace(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn switch_workspace(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.switch_workspace(&id) {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_agents(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.agents(&id) {
        Ok(agents) => Json(json!({ "agents": agents })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnAgentBody {
    name: String,
    cli: Option<String>,
    task: Option<String>,
}

async fn spawn_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SpawnAgentBody>,
) -> Response {
    if body.name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name is required" })),
        )
            .into_response();
    }
    match state
        .orchestrator
        .spawn_agent(&id, &body.name, body.cli.as_deref(), body.task.as_deref())
        .await
    {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "spawned": body.name }))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn stop_agent(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    match state.orchestrator.stop_agent(&id, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------
// WebSockets
// ---------------------------------------------------------------------

/// Agent transport: envelopes over WebSocket against the active workspace's
/// daemon.
async fn ws_agent(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(daemon) = state.orchestrator.active_daemon() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no active workspace daemon" })),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| daemon.serve_ws(socket))
}

/// Dashboard: an init snapshot, then `event` pushes, with a 30 s ping
/// keepalive that drops clients which stop ponging.
async fn ws_dashboard(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| dashboard_loop(state, socket))
}

async fn dashboard_loop(state: AppState, socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();

    let agents = state
        .orchestrator
        .active_daemon()
        .map(|daemon| daemon.roster())
        .unwrap_or_default();
    let snapshot = json!({
        "type": "init",
        "data": {
            "workspaces": state.orchestrator.workspaces(),
            "activeWorkspaceId": state.orchestrator.active_workspace_id(),
            "agents": agents,
        }
    });
    if tx
        .send(WsMessage::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut orchestrator_events = state.orchestrator.subscribe_events();
    let mut router_events = state
        .orchestrator
        .active_daemon()
        .map(|daemon| daemon.router().subscribe_events());

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.tick().await; // the first tick completes immediately
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                // No pong since the last cycle: terminate the client.
                if awaiting_pong {
                    debug!("dashboard client missed keepalive; closing");
                    break;
                }
                awaiting_pong = true;
                if tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            event = orchestrator_events.recv() => match event {
                Ok(event) => {
                    if push_event(&mut tx, &json!(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = recv_router_event(&mut router_events) => match event {
                Some(event) => {
                    if push_event(&mut tx, &json!(event)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = rx.next() => match message {
                Some(Ok(WsMessage::Pong(_))) => awaiting_pong = false,
                Some(Ok(WsMessage::Text(text))) => {
                    if handle_client_message(&state, &mut tx, text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

async fn recv_router_event(
    receiver: &mut Option<broadcast::Receiver<RouterEvent>>,
) -> Option<RouterEvent> {
    match receiver {
        Some(receiver) => loop {
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => futures::future::pending().await,
    }
}

async fn push_event(
    tx: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    data: &serde_json::Value,
) -> std::result::Result<(), axum::Error> {
    let frame = json!({ "type": "event", "data": data });
    tx.send(WsMessage::Text(frame.to_string().into())).await
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    SwitchWorkspace { data: String },
}

async fn handle_client_message(
    state: &AppState,
    tx: &mut futures::stream::SplitSink<WebSocket, WsMessage>,
    text: &str,
) -> std::result::Result<(), axum::Error> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => {
            tx.send(WsMessage::Text(json!({"type": "pong"}).to_string().into()))
                .await
        }
        Ok(ClientMessage::SwitchWorkspace { data }) => {
            if let Err(e) = state.orchestrator.switch_workspace(&data) {
                debug!(id = %data, error = %e, "ws switch_workspace failed");
            }
            Ok(())
        }
        Err(_) => {
            debug!("unrecognized dashboard client message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, StorageConfig, StorageType};
    use crate::orchestrator::NullSpawner;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> (Router, AppState) {
        let config = DaemonConfig {
            data_dir: dir.join("data"),
            config_dir: dir.join("config"),
            storage: StorageConfig {
                storage_type: StorageType::Memory,
                path: None,
                url: None,
            },
            cloud: None,
        };
        let metrics = RelayMetrics::new();
        let orchestrator = Arc::new(
            Orchestrator::load(config, metrics.clone(), Arc::new(NullSpawner), false).unwrap(),
        );
        let state = AppState {
            orchestrator,
            metrics,
        };
        (create_router(state.clone()), state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _state) = app(dir.path());

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_text() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state) = app(dir.path());
        state.metrics.messages_delivered.inc();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("relay_messages_delivered_total 1"));
    }

    #[tokio::test]
    async fn workspace_crud() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _state) = app(dir.path());

        // Create.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workspaces")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"name": "main", "path": "/tmp/ws"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();

        // List.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/workspaces")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["workspaces"].as_array().unwrap().len(), 1);
        assert_eq!(body["activeWorkspaceId"], json!(id));

        // Read.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/workspaces/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Switch.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/workspaces/{id}/switch"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Delete.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/workspaces/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Unknown id is 404.
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/workspaces/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_workspace_validates_body() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _state) = app(dir.path());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/workspaces")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "", "path": ""}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agents_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (app, state) = app(dir.path());
        let record = state
            .orchestrator
            .add_workspace("main", dir.path())
            .unwrap();

        // Empty roster without a running daemon.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/workspaces/{}/agents", record.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["agents"].as_array().unwrap().is_empty());

        // Spawn through the null spawner.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/workspaces/{}/agents", record.id))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": "worker-1"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        // Stop.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/workspaces/{}/agents/worker-1", record.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Unknown workspace is 404.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/workspaces/nope/agents")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
