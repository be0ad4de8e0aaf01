use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::activation::{ActivationReason, ActivationService, ActivationStatus};
use crate::database::{AgentLogRow, FleetDatabase};
use crate::events::{EventEnvelope, FleetEvent};
use crate::fleet::{AgentCategory, AgentRecord, FleetManager, SystemStats};
use crate::runtime::FleetRuntime;
use crate::scheduler::SchedulerCommand;

#[derive(Clone)]
pub struct ServerState {
    pub manager: Arc<FleetManager>,
    pub activation: Arc<ActivationService>,
    pub db: Arc<FleetDatabase>,
    pub auth: BackendAuthConfig,
    pub commands: flume::Sender<SchedulerCommand>,
    pub ws_events: broadcast::Sender<EventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListAgentsQuery {
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListLogsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    activated: bool,
    status: ActivationStatus,
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    status: &'static str,
}

pub async fn serve_backend(
    mut runtime: FleetRuntime,
    event_rx: flume::Receiver<FleetEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("TMS_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8711".to_string())
        .parse::<SocketAddr>()
        .context("Invalid TMS_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        manager: runtime.manager.clone(),
        activation: runtime.activation.clone(),
        db: runtime.db.clone(),
        auth,
        commands: runtime.command_tx.clone(),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.spawn_scheduler()?;

    let protected = Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/agents", get(list_agents))
        .route("/agents/reinitialize", post(reinitialize_agents))
        .route("/agents/:id", get(get_agent))
        .route("/agents/:id/dispatch", post(dispatch_agent))
        .route("/activate", post(activate))
        .route("/deactivate", post(deactivate))
        .route("/logs", get(list_logs))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("TMS fleet backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<FleetEvent>,
    ws_events: broadcast::Sender<EventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let _ = ws_events.send(event.into_envelope());
        }
    });
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("TMS_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("TMS_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "TMS_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid TMS_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(State(state): State<Arc<ServerState>>) -> Response {
    match state.activation.load() {
        Ok(Some(status)) => Json(StatusResponse {
            activated: status.is_running(),
            status,
        })
        .into_response(),
        Ok(None) => Json(StatusResponse {
            activated: false,
            status: ActivationStatus::default(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Status read failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_stats(State(state): State<Arc<ServerState>>) -> Json<SystemStats> {
    let status = state.activation.load().ok().flatten();
    Json(state.manager.system_stats(status.as_ref()).await)
}

async fn list_agents(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Vec<AgentRecord>>, StatusCode> {
    let agents = state.manager.snapshot().await;
    match query.category {
        Some(raw) => {
            let category =
                AgentCategory::parse(&raw).ok_or(StatusCode::BAD_REQUEST)?;
            Ok(Json(
                agents
                    .into_iter()
                    .filter(|a| a.category == category)
                    .collect(),
            ))
        }
        None => Ok(Json(agents)),
    }
}

async fn get_agent(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<AgentRecord>, StatusCode> {
    state
        .manager
        .agent(&id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn dispatch_agent(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CommandAccepted>, StatusCode> {
    if state.manager.agent(&id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    state
        .commands
        .send(SchedulerCommand::DispatchAgent(id))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(CommandAccepted { status: "accepted" }))
}

async fn reinitialize_agents(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<CommandAccepted>, StatusCode> {
    state
        .commands
        .send(SchedulerCommand::Reinitialize)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(CommandAccepted { status: "accepted" }))
}

async fn activate(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<CommandAccepted>, StatusCode> {
    state
        .commands
        .send(SchedulerCommand::Activate(ActivationReason::Manual))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(CommandAccepted { status: "accepted" }))
}

async fn deactivate(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<CommandAccepted>, StatusCode> {
    state
        .commands
        .send(SchedulerCommand::Deactivate)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(CommandAccepted { status: "accepted" }))
}

async fn list_logs(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListLogsQuery>,
) -> Result<Json<Vec<AgentLogRow>>, StatusCode> {
    let limit = query.limit.unwrap_or(50).min(500);
    state
        .db
        .recent_logs(limit)
        .map(Json)
        .map_err(|e| {
            tracing::error!("Log read failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.ws_events.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, rx))
}

async fn stream_events(mut socket: WebSocket, mut rx: broadcast::Receiver<EventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let Ok(json) = serde_json::to_string(&envelope) else {
                    continue;
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("WS client lagged; skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(mode: AuthMode, token: Option<&str>) -> BackendAuthConfig {
        BackendAuthConfig {
            mode,
            token: token.map(|t| t.to_string()),
        }
    }

    #[test]
    fn auth_mode_parsing() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        );
        assert_eq!(
            parse_auth_mode(Some("ON".to_string())).unwrap(),
            AuthMode::Required
        );
        assert!(parse_auth_mode(Some("sometimes".to_string())).is_err());
    }

    #[test]
    fn authorize_requires_matching_bearer_token() {
        let config = auth(AuthMode::Required, Some("sekrit"));

        let mut headers = HeaderMap::new();
        assert!(authorize(&headers, &config).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(authorize(&headers, &config).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer sekrit".parse().unwrap());
        assert!(authorize(&headers, &config).is_ok());
    }

    #[test]
    fn disabled_mode_skips_auth() {
        let config = auth(AuthMode::Disabled, None);
        assert!(authorize(&HeaderMap::new(), &config).is_ok());
    }
}
