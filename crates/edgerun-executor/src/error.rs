// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgerun-executor.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::runner::RunnerError;

/// Executor errors. None of them are retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Routing headers are missing or malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The function source could not be fetched or written.
    #[error("Failed to materialize {key}: {reason}")]
    CodeMaterialization {
        /// Object key of the function source.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// The worker failed to start or crashed.
    #[error("Worker failed: {0}")]
    WorkerSpawn(String),

    /// The worker answered with something that is not a valid response.
    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),

    /// The worker exceeded the execution timeout.
    #[error("Function execution timed out")]
    Timeout,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using [`ExecutorError`].
pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<RunnerError> for ExecutorError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::Timeout => Self::Timeout,
            RunnerError::Protocol(message) => Self::InvalidResponse(message),
            other => Self::WorkerSpawn(other.to_string()),
        }
    }
}

impl ExecutorError {
    /// HTTP status this error is surfaced as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::CodeMaterialization { .. }
            | Self::WorkerSpawn(_)
            | Self::InvalidResponse(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ExecutorError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
