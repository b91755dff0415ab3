//! HTTP and websocket server: media streams, session kicks, health.
//!
//! One process serves many calls. Before the listener binds, a canary
//! realtime session is created and discarded so a bad model credential
//! or endpoint is caught at startup instead of on the first live call.

use crate::booking;
use crate::call::CallRegistry;
use crate::config::Config;
use crate::crm::CrmClient;
use crate::error::{BridgeError, Result};
use crate::openai;
use crate::telephony;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub crm: CrmClient,
    pub registry: CallRegistry,
    pub sessions: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let crm = CrmClient::new(&config.crm);
        Self {
            config,
            crm,
            registry: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a dialing session was announced via `/start-session`.
    pub fn session_known(&self, session_id: &str) -> bool {
        !session_id.is_empty()
            && self
                .sessions
                .lock()
                .map(|sessions| sessions.contains(session_id))
                .unwrap_or(false)
    }

    pub fn active_calls(&self) -> usize {
        self.registry.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionKick {
    #[serde(default)]
    user_email: Option<String>,
    session_id: String,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    total: Option<u64>,
}

/// Build the process router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/media-stream", get(media_upgrade))
        .route("/health", get(health))
        .route("/start-session", post(start_session))
        .route("/stop-session", post(stop_session))
        .with_state(state)
}

async fn media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| telephony::handle_stream(socket, state))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "activeCalls": state.active_calls(),
    }))
}

fn authorized(headers: &HeaderMap, state: &AppState) -> bool {
    headers
        .get("x-ai-dialer-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.is_empty() && v == state.config.crm.cron_key)
}

async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(kick): Json<SessionKick>,
) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false})));
    }
    info!(
        session_id = %kick.session_id,
        user = kick.user_email.as_deref().unwrap_or("-"),
        folder = kick.folder_id.as_deref().unwrap_or("-"),
        total = kick.total.unwrap_or(0),
        "session started"
    );
    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.insert(kick.session_id);
    }
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

async fn stop_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(kick): Json<SessionKick>,
) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false})));
    }
    info!(session_id = %kick.session_id, "session stopped");
    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.remove(&kick.session_id);
    }
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

/// Run the server until ctrl-c. Performs startup checks first.
///
/// # Errors
///
/// Returns an error when a startup check fails or the listener cannot
/// bind. Startup failures are the only fatal configuration errors.
pub async fn run(config: Config) -> Result<()> {
    // The slot math is meaningless without the IANA catalog.
    if !booking::is_valid_tz(booking::DEFAULT_TZ) {
        return Err(BridgeError::Config(
            "IANA time zone catalog unavailable".to_owned(),
        ));
    }

    openai::canary(&config.model).await?;

    let state = AppState::new(Arc::new(config));
    let registry = state.registry.clone();
    let port = state.config.server.port;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "voice bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await
        .map_err(|e| BridgeError::Telephony(format!("server error: {e}")))?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(registry: CallRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed");
        return;
    }
    info!("shutdown requested, ending live calls");
    if let Ok(handles) = registry.lock() {
        for handle in handles.values() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(Arc::new(Config::default()))
    }

    #[test]
    fn unknown_session_is_not_known() {
        let state = state();
        assert!(!state.session_known("sess-1"));
        assert!(!state.session_known(""));
    }

    #[test]
    fn sessions_track_start_and_stop() {
        let state = state();
        state
            .sessions
            .lock()
            .unwrap()
            .insert("sess-1".to_owned());
        assert!(state.session_known("sess-1"));
        state.sessions.lock().unwrap().remove("sess-1");
        assert!(!state.session_known("sess-1"));
    }

    #[test]
    fn no_calls_at_boot() {
        assert_eq!(state().active_calls(), 0);
    }
}
