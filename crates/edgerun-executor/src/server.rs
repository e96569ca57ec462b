// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of the function execution service.
//!
//! - any request carrying `x-function-path`, `x-deployment-id` and
//!   `x-project-id` is dispatched to a worker
//! - `GET /_edgerun/health` reports liveness
//! - `GET /_edgerun/workers` lists identity states
//! - `GET /_edgerun/logs?deployment={id}` streams worker output as
//!   Server-Sent Events

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use edgerun_core::headers::{X_ACCEL_BUFFERING, X_DEPLOYMENT_ID, X_FUNCTION_PATH, X_PROJECT_ID};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{ExecutorError, Result};
use crate::logs::LogHub;
use crate::runner::WorkerRequest;
use crate::supervisor::{WorkerSupervisor, relative_function_path};

/// Default cap on request bodies handed to workers.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state of the executor's request handlers.
pub struct ExecutorState {
    pub supervisor: Arc<WorkerSupervisor>,
    pub logs: LogHub,
    pub max_request_body_bytes: usize,
    started_at: Instant,
}

impl ExecutorState {
    pub fn new(supervisor: Arc<WorkerSupervisor>, logs: LogHub) -> Self {
        Self {
            supervisor,
            logs,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            started_at: Instant::now(),
        }
    }
}

/// Build the executor router.
pub fn router(state: Arc<ExecutorState>) -> Router {
    Router::new()
        .route("/_edgerun/health", get(health))
        .route("/_edgerun/workers", get(workers))
        .route("/_edgerun/logs", get(logs))
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<ExecutorState>>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
        "runner": state.supervisor.runner().runner_type(),
        "workers": state.supervisor.registry().len(),
        "active_workers": state.supervisor.runner().active_workers(),
    }))
}

async fn workers(State(state): State<Arc<ExecutorState>>) -> impl IntoResponse {
    Json(json!({ "workers": state.supervisor.registry().list() }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    deployment: Option<String>,
}

async fn logs(
    State(state): State<Arc<ExecutorState>>,
    Query(query): Query<LogsQuery>,
) -> Response<Body> {
    let stream = state
        .logs
        .subscribe(query.deployment)
        .into_stream()
        .filter_map(|line| async move {
            let json = serde_json::to_string(&*line).ok()?;
            Some(Ok::<_, Infallible>(format!("data: {}\n\n", json)))
        });

    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(X_ACCEL_BUFFERING, "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn required_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ExecutorError::BadRequest(format!("missing {} header", name)))
}

async fn dispatch(State(state): State<Arc<ExecutorState>>, request: Request) -> Response<Body> {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &ExecutorState, request: Request) -> Result<Response<Body>> {
    let (parts, body) = request.into_parts();

    let function_path = required_header(&parts.headers, X_FUNCTION_PATH)?;
    let deployment_id = required_header(&parts.headers, X_DEPLOYMENT_ID)?;
    let project_id = required_header(&parts.headers, X_PROJECT_ID)?;
    let function_path = relative_function_path(deployment_id, function_path);

    let body = to_bytes(body, state.max_request_body_bytes)
        .await
        .map_err(|e| ExecutorError::BadRequest(format!("unreadable request body: {}", e)))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = parts.headers.clone();
    for name in [X_FUNCTION_PATH, X_DEPLOYMENT_ID, X_PROJECT_ID] {
        headers.remove(name);
    }

    let request = WorkerRequest {
        method: parts.method.clone(),
        path_and_query,
        headers,
        body,
    };

    state
        .supervisor
        .dispatch(deployment_id, project_id, function_path, request)
        .await
        .inspect_err(|e| {
            warn!(
                deployment_id = %deployment_id,
                function_path = %function_path,
                error = %e,
                "Dispatch failed"
            )
        })
}
