//! Dashboard read/stream API.
//!
//! Two endpoints: `GET /api/db` serves the full store snapshot, and
//! `GET /ws` upgrades to a WebSocket that receives the currently active
//! job. A background sampler polls the store once a second and broadcasts
//! only when the serialised payload actually changed; every new subscriber
//! gets one frame immediately on connect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config;
use crate::store::{JobSnapshot, Store, StoreHandle};

/// How often the active job is sampled.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// WebSocket keepalive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: config::dashboard_port(),
            db_path: config::db_path(),
        }
    }
}

pub struct AppState {
    db_path: PathBuf,
    store: tokio::sync::Mutex<Option<StoreHandle>>,
    pub ws_tx: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(db_path: PathBuf, ws_tx: broadcast::Sender<String>) -> Self {
        Self {
            db_path,
            store: tokio::sync::Mutex::new(None),
            ws_tx,
        }
    }

    /// Open the store lazily; None while the file does not exist yet.
    async fn store(&self) -> Result<Option<StoreHandle>> {
        let mut guard = self.store.lock().await;
        if guard.is_none() {
            if !self.db_path.exists() {
                return Ok(None);
            }
            let path = self.db_path.clone();
            let store =
                tokio::task::spawn_blocking(move || Store::open(&path)).await.context("Store open task panicked")??;
            *guard = Some(StoreHandle::new(store));
        }
        Ok(guard.clone())
    }
}

/// The `{type: "active_job", job}` frame, serialised once so change
/// detection and broadcast agree byte-for-byte.
pub fn active_job_frame(job: Option<&JobSnapshot>) -> String {
    serde_json::json!({ "type": "active_job", "job": job }).to_string()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS]);
    Router::new()
        .route("/api/db", get(snapshot_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .layer(cors)
        .with_state(state)
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store().await {
        Ok(None) => Json(serde_json::json!({ "jobs": [] })).into_response(),
        Ok(Some(store)) => match store.read_dashboard_data().await {
            Ok(data) => Json(serde_json::to_value(&data).unwrap_or_default()).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
        },
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // First frame straight away so the client renders without waiting for
    // the next change.
    let initial = match state.store().await {
        Ok(Some(store)) => {
            let job = store.read_active_job().await.ok().flatten();
            active_job_frame(job.as_ref())
        }
        _ => active_job_frame(None),
    };
    if sender.send(Message::Text(initial)).await.is_err() {
        return;
    }

    let mut rx = state.ws_tx.subscribe();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Poll the active job at 1 Hz; broadcast a frame only when the payload
/// changed since the last broadcast.
pub fn spawn_active_job_sampler(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        let mut last: Option<String> = None;
        loop {
            ticker.tick().await;
            let frame = match state.store().await {
                Ok(Some(store)) => match store.read_active_job().await {
                    Ok(job) => active_job_frame(job.as_ref()),
                    Err(e) => {
                        eprintln!("[server] Failed to read active job: {:#}", e);
                        continue;
                    }
                },
                Ok(None) => active_job_frame(None),
                Err(e) => {
                    eprintln!("[server] Store unavailable: {:#}", e);
                    continue;
                }
            };
            if last.as_deref() != Some(frame.as_str()) {
                let _ = state.ws_tx.send(frame.clone());
                last = Some(frame);
            }
        }
    })
}

/// Bind and serve until ctrl-c.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let state = Arc::new(AppState::new(config.db_path, ws_tx));

    let sampler = spawn_active_job_sampler(Arc::clone(&state));
    let app = build_router(Arc::clone(&state));

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    println!("Dashboard API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sampler.abort();
    println!("Server shut down.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobMeta, JobStatus};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state_for(db_path: PathBuf) -> Arc<AppState> {
        let (ws_tx, _) = broadcast::channel(16);
        Arc::new(AppState::new(db_path, ws_tx))
    }

    fn meta(job_id: &str) -> JobMeta {
        JobMeta::new(job_id)
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_the_store_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(state_for(dir.path().join("missing.db")));
        let resp = app
            .oneshot(Request::builder().uri("/api/db").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({ "jobs": [] }));
    }

    #[tokio::test]
    async fn snapshot_serves_recorded_jobs() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("orchestrator.db");
        {
            let mut store = Store::open(&db_path).unwrap();
            store
                .mark_job_status(&meta("job-web"), JobStatus::Running)
                .unwrap();
        }

        let app = build_router(state_for(db_path));
        let resp = app
            .oneshot(Request::builder().uri("/api/db").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["jobs"][0]["jobId"], "job-web");
        assert_eq!(json["jobs"][0]["status"], "running");
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(state_for(dir.path().join("x.db")));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_allows_any_origin_for_get() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = build_router(state_for(dir.path().join("x.db")));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/db")
                    .header("origin", "http://elsewhere.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let allow = resp
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok());
        assert_eq!(allow, Some("*"));
    }

    #[tokio::test]
    async fn sampler_broadcasts_on_change_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("orchestrator.db");
        {
            let mut store = Store::open(&db_path).unwrap();
            store
                .mark_job_status(&meta("job-live"), JobStatus::Running)
                .unwrap();
        }

        let state = state_for(db_path.clone());
        let mut rx = state.ws_tx.subscribe();
        let sampler = spawn_active_job_sampler(Arc::clone(&state));

        // First sample: a frame with the live job.
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sampler should broadcast")
            .unwrap();
        assert!(frame.contains("\"type\":\"active_job\""));
        assert!(frame.contains("job-live"));

        // Unchanged payload: nothing for a couple of ticks.
        let silence =
            tokio::time::timeout(Duration::from_millis(2500), rx.recv()).await;
        assert!(silence.is_err(), "no re-broadcast without a change");

        // Terminal transition: broadcast the null-job frame.
        {
            let mut store = Store::open(&db_path).unwrap();
            store
                .mark_job_status(&meta("job-live"), JobStatus::Done)
                .unwrap();
        }
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sampler should notice the change")
            .unwrap();
        assert!(frame.contains("\"job\":null"));

        sampler.abort();
    }

    #[test]
    fn active_job_frame_shape() {
        assert_eq!(
            active_job_frame(None),
            "{\"job\":null,\"type\":\"active_job\"}"
        );
    }
}
