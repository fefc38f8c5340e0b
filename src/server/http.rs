//! HTTP server implementation
//!
//! Routes:
//! - `POST /` - run-task webhook
//! - `GET /health` - liveness probe
//!
//! The webhook runs the pipeline in its own task so a panic anywhere in it
//! still produces a response.

use std::any::Any;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::pipeline::{PipelineError, RunTaskOutcome, RunTaskPipeline};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RunTaskPipeline>,
    /// Cancelled on shutdown; in-flight polls answer 503.
    pub shutdown: CancellationToken,
}

pub fn create_router(config: HttpConfig, state: AppState) -> Router {
    Router::new()
        .route("/", post(run_task_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state)
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("run_task", %request_id);

    let pipeline = state.pipeline.clone();
    let cancel = state.shutdown.child_token();
    let task = tokio::spawn(
        async move { pipeline.run(&headers, &body, cancel).await }.instrument(span.clone()),
    );

    let response = match task.await {
        Ok(Ok(RunTaskOutcome::TestStage)) => plain(StatusCode::OK, ""),
        Ok(Ok(RunTaskOutcome::Completed {
            callback_status, ..
        })) => plain(StatusCode::OK, callback_status.to_string()),
        Ok(Err(err)) => error_response(&err),
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic().as_ref())
            } else {
                join_err.to_string()
            };
            error!(target: "http", parent: &span, "Task errored out with exception: {}", message);
            plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Task errored out with exception: {}", message),
            )
        }
    };

    info!(target: "http", parent: &span, status = response.status().as_u16(), "run task request finished");
    response
}

fn error_response(err: &PipelineError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!(target: "http", status = status.as_u16(), "{}", err);
    } else {
        warn!(target: "http", status = status.as_u16(), "{}", err);
    }
    plain(status, err.to_string())
}
