//! Mock completion server.
//!
//! Binds an ephemeral 127.0.0.1 port and routes chat-completions requests
//! into the replay engine. The accept loop runs on a background thread with
//! its own current-thread tokio runtime so the test driver stays free to
//! drive the consumer; the test blocks only in `start()` and `stop()`.

use crate::errors::HarnessError;
use crate::logging::{JsonlLogger, LogEvent};
use crate::replay::{CompletionRequest, ReplayEngine};
use crate::trajectory::Trajectory;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

pub const COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";

// ── Server state shared with the router ──────────────────────────────────────

struct ServerState {
    engine: Arc<ReplayEngine>,
    logger: Option<JsonlLogger>,
}

impl ServerState {
    fn log(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(logger) = &self.logger {
            let _ = logger.append(&LogEvent {
                level: "info",
                event_type,
                payload,
            });
        }
    }
}

// ── MockLlmServer ─────────────────────────────────────────────────────────────

enum Lifecycle {
    Created,
    Running {
        base_url: String,
        shutdown: oneshot::Sender<()>,
        thread: JoinHandle<()>,
    },
    Stopped,
}

/// One running listener bound to an ephemeral port.
///
/// Lifecycle: created -> `start()` -> serving -> `stop()`. A stopped handle
/// is never restarted; `start()` twice and `stop()` on a handle that is not
/// running are both errors.
pub struct MockLlmServer {
    engine: Arc<ReplayEngine>,
    logger: Option<JsonlLogger>,
    lifecycle: Lifecycle,
}

impl MockLlmServer {
    pub fn new(trajectory: Trajectory) -> Self {
        Self {
            engine: Arc::new(ReplayEngine::new(trajectory)),
            logger: None,
            lifecycle: Lifecycle::Created,
        }
    }

    pub fn with_logger(mut self, logger: JsonlLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// The engine owning the replay cursor, for post-replay assertions.
    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    pub fn base_url(&self) -> Option<&str> {
        match &self.lifecycle {
            Lifecycle::Running { base_url, .. } => Some(base_url.as_str()),
            _ => None,
        }
    }

    /// Bind, begin accepting, and return the reachable base address.
    ///
    /// Blocks until the listener is ready (or the bind failed).
    pub fn start(&mut self) -> Result<String, HarnessError> {
        match self.lifecycle {
            Lifecycle::Created => {}
            _ => return Err(HarnessError::ServerAlreadyStarted),
        }

        let state = Arc::new(ServerState {
            engine: Arc::clone(&self.engine),
            logger: self.logger.clone(),
        });
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, HarnessError>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let serve_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("mock-llm-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = addr_tx.send(Err(HarnessError::Bind(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", 0)).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = addr_tx.send(Err(HarnessError::Bind(e.to_string())));
                            return;
                        }
                    };
                    let local_addr = match listener.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            let _ = addr_tx.send(Err(HarnessError::Bind(e.to_string())));
                            return;
                        }
                    };
                    let app = build_router(serve_state);
                    let _ = addr_tx.send(Ok(local_addr));
                    let _ = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                });
            })
            .map_err(|e| HarnessError::Bind(e.to_string()))?;

        let local_addr = addr_rx
            .recv()
            .map_err(|_| HarnessError::Bind("server thread exited before binding".to_string()))??;
        let base_url = format!("http://{local_addr}/");
        state.log(
            "server_started",
            json!({"base_url": base_url, "steps": self.engine.step_count()}),
        );
        self.lifecycle = Lifecycle::Running {
            base_url: base_url.clone(),
            shutdown: shutdown_tx,
            thread,
        };
        Ok(base_url)
    }

    /// Release the listener and wind down the accept loop.
    ///
    /// Safe to call exactly once per running handle; calling it on a handle
    /// that is not running is an error.
    pub fn stop(&mut self) -> Result<(), HarnessError> {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running {
                shutdown, thread, ..
            } => {
                let _ = shutdown.send(());
                thread
                    .join()
                    .map_err(|_| HarnessError::Io("server thread panicked".to_string()))?;
                if let Some(logger) = &self.logger {
                    let _ = logger.append(&LogEvent {
                        level: "info",
                        event_type: "server_stopped",
                        payload: json!({"served": self.engine.position()}),
                    });
                }
                Ok(())
            }
            other => {
                self.lifecycle = other;
                Err(HarnessError::ServerNotRunning)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }
}

impl Drop for MockLlmServer {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(COMPLETIONS_ENDPOINT, post(handle_completions))
        .with_state(state)
}

async fn handle_completions(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    match state.engine.handle(&request) {
        Ok(step) => {
            state.log(
                "step_matched",
                json!({
                    "index": state.engine.position() - 1,
                    "status": step.status,
                }),
            );
            // Loading already rejects out-of-range statuses; never rewrite a
            // bad one to success.
            match StatusCode::from_u16(step.status) {
                Ok(status) => (status, Json(step.body)).into_response(),
                Err(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": {
                            "type": "replay_error",
                            "message": format!(
                                "recorded status {} is not a valid http status",
                                step.status
                            ),
                        }
                    })),
                )
                    .into_response(),
            }
        }
        Err(err) => {
            state.log(
                error_kind(&err),
                json!({
                    "index": state.engine.position(),
                    "message": err.to_string(),
                }),
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": {
                        "type": error_kind(&err),
                        "message": err.to_string(),
                    }
                })),
            )
                .into_response()
        }
    }
}

fn error_kind(err: &HarnessError) -> &'static str {
    match err {
        HarnessError::UnexpectedRequest { .. } => "unexpected_request",
        HarnessError::TrajectoryExhausted { .. } => "trajectory_exhausted",
        _ => "replay_error",
    }
}
