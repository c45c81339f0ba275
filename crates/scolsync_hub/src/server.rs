//! The realtime HTTP hub.

use crate::error::HubResult;
use crate::events::{ChangeEvent, EventBroadcaster};
use crate::staging::{Staging, TransferPayload};
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use scolsync_store::{GradeCell, LocalStore, StoreError};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::{ServeDir, ServeFile};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address. Port 0 picks an ephemeral port; the hub listens on all
    /// interfaces so every device on the segment can reach it.
    pub bind_addr: SocketAddr,
    /// Bundled browser UI directory, served with an SPA fallback.
    pub web_dir: Option<PathBuf>,
    /// Root of the transfer staging area.
    pub staging_root: PathBuf,
}

impl HubConfig {
    /// Creates a configuration with the default ephemeral bind address.
    pub fn new(staging_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            web_dir: None,
            staging_root: staging_root.into(),
        }
    }

    /// Sets the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the browser UI directory.
    pub fn with_web_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.web_dir = Some(dir.into());
        self
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<LocalStore>,
    events: Arc<EventBroadcaster>,
    staging: Arc<Staging>,
}

/// The LAN hub server.
pub struct Hub {
    config: HubConfig,
}

impl Hub {
    /// Creates a hub from its configuration.
    pub fn new(config: HubConfig) -> Self {
        Self { config }
    }

    /// Binds the listener and starts serving; returns the owned handle.
    pub async fn start(self, store: Arc<LocalStore>) -> HubResult<HubHandle> {
        let events = Arc::new(EventBroadcaster::new());
        let staging = Arc::new(Staging::open(&self.config.staging_root)?);
        let state = AppState {
            store,
            events: Arc::clone(&events),
            staging: Arc::clone(&staging),
        };

        let router = build_router(state, self.config.web_dir.clone());

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "hub listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "hub server stopped with error");
            }
        });

        Ok(HubHandle {
            local_addr,
            events,
            staging,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

/// The running hub: port, event fan-out, staging area, and shutdown.
pub struct HubHandle {
    local_addr: SocketAddr,
    events: Arc<EventBroadcaster>,
    staging: Arc<Staging>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl HubHandle {
    /// The port the hub bound.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The event fan-out, for embedding code that broadcasts its own events
    /// (e.g. discovery peer updates).
    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    /// The staging area, for the user-initiated accept/discard surface.
    pub fn staging(&self) -> &Arc<Staging> {
        &self.staging
    }

    /// Stops the listener and waits for in-flight requests to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
        tracing::info!("hub stopped");
    }
}

fn build_router(state: AppState, web_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/api/events", get(subscribe_events))
        .route("/api/classes", get(list_classes))
        .route("/api/classes/:id/full", get(class_full))
        .route("/api/grades/batch", post(grades_batch))
        .route("/api/transfer", post(receive_transfer))
        .with_state(state);

    match web_dir {
        Some(dir) => {
            let index = ServeFile::new(dir.join("index.html"));
            api.fallback_service(ServeDir::new(dir).fallback(index))
        }
        None => api.fallback(missing_web_ui),
    }
}

async fn missing_web_ui() -> Response {
    (StatusCode::NOT_FOUND, "web UI not bundled").into_response()
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::RowNotFound { .. } => error_response(StatusCode::NOT_FOUND, err.to_string()),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// `GET /api/events` — long-lived event stream.
async fn subscribe_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (id, rx) = state.events.subscribe();
    tracing::debug!(subscriber = id, "event stream opened");

    let stream = UnboundedReceiverStream::new(rx)
        .map(|event| Event::default().json_data(&event))
        .filter_map(|result| async move { result.ok().map(Ok::<_, Infallible>) });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /api/classes` — class list projection.
async fn list_classes(State(state): State<AppState>) -> Response {
    match state.store.list_classes() {
        Ok(classes) => Json(classes).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// `GET /api/classes/:id/full` — one class with students, subjects, grades.
async fn class_full(State(state): State<AppState>, UrlPath(id): UrlPath<i64>) -> Response {
    match state.store.class_full(id) {
        Ok(full) => Json(full).into_response(),
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct GradeBatchRequest {
    updates: Vec<GradeCell>,
    #[serde(default, rename = "senderId")]
    sender_id: Option<String>,
}

/// `POST /api/grades/batch` — atomic multi-cell upsert + broadcast.
async fn grades_batch(
    State(state): State<AppState>,
    Json(request): Json<GradeBatchRequest>,
) -> Response {
    if request.updates.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "valid updates array required".into(),
        );
    }

    match state.store.upsert_grade_cells(&request.updates) {
        Ok(count) => {
            tracing::info!(count, sender = ?request.sender_id, "grade batch applied");
            state
                .events
                .broadcast(&ChangeEvent::db_changed("grades_batch", request.sender_id));
            Json(serde_json::json!({ "success": true })).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

/// `POST /api/transfer` — store-and-forward intake. The payload only waits
/// in staging; applying it is a separate, user-initiated step.
async fn receive_transfer(
    State(state): State<AppState>,
    Json(payload): Json<TransferPayload>,
) -> Response {
    match state.staging.save(&payload) {
        Ok(filename) => {
            state.events.broadcast(&ChangeEvent {
                event: "transfer:received".into(),
                sender_id: None,
                data: serde_json::json!({ "filename": filename, "sender": payload.sender }),
            });
            Json(serde_json::json!({ "success": true, "filename": filename })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
