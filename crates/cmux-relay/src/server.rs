use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bridge::{BridgeController, SessionRequest};
use crate::config::BridgeConfig;
use crate::error::RelayError;
use crate::executor::{ExecTarget, RemoteExecutor};
use crate::resize::TerminalSize;
use crate::shell::is_valid_shell;

pub struct AppState {
    bridge: BridgeController,
    active_sessions: AtomicUsize,
    total_sessions: AtomicU64,
}

impl AppState {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            bridge: BridgeController::new(executor, config),
            active_sessions: AtomicUsize::new(0),
            total_sessions: AtomicU64::new(0),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

/// Counts a session as active for as long as it is alive.
struct SessionGuard<'a>(&'a AppState);

impl<'a> SessionGuard<'a> {
    fn new(state: &'a AppState) -> Self {
        state.active_sessions.fetch_add(1, Ordering::SeqCst);
        state.total_sessions.fetch_add(1, Ordering::Relaxed);
        Self(state)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecQuery {
    pub shell: Option<String>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

impl ExecQuery {
    fn initial_size(&self) -> Option<TerminalSize> {
        let size = TerminalSize::new(self.cols.unwrap_or(0), self.rows.unwrap_or(0));
        (!size.is_empty()).then(|| size.normalized())
    }

    fn into_request(self, target: String) -> Result<SessionRequest, RelayError> {
        if target.trim().is_empty() {
            return Err(RelayError::InvalidRequest("target must not be empty".to_string()));
        }
        let preferred_shell = match self.shell.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(shell) if is_valid_shell(shell) => Some(shell.to_string()),
            Some(shell) => {
                return Err(RelayError::InvalidRequest(format!(
                    "unsupported shell {:?}",
                    shell
                )))
            }
        };
        Ok(SessionRequest {
            initial_size: self.initial_size(),
            target: ExecTarget::new(target),
            preferred_shell,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(axum::http::HeaderValue::from_static("*"));

    Router::new()
        .route("/health", get(health))
        .route("/containers/:target/exec", get(exec_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!(
        "relay listening on {} (backend: {})",
        addr,
        state.bridge.backend()
    );

    axum::serve(listener, build_router(state))
        .await
        .context("Server error")?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "backend": state.bridge.backend(),
        "sessions": state.active_sessions(),
        "total_sessions": state.total_sessions.load(Ordering::Relaxed),
    }))
}

async fn exec_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    Query(query): Query<ExecQuery>,
) -> Result<Response, RelayError> {
    let request = query.into_request(target)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, request)))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, request: SessionRequest) {
    let _guard = SessionGuard::new(&state);
    let report = state.bridge.serve_socket(socket, request).await;
    info!(
        "[term-ws:{}] session ended: {:?} (active command: {:?})",
        report.session_id, report.outcome, report.active_command
    );
    if report.protocol_errors > 0 {
        warn!(
            "[term-ws:{}] client sent {} frame(s) that broke the protocol",
            report.session_id, report.protocol_errors
        );
    }
}
