// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for worker runners.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use edgerun_core::object_store::ByteStream;
use thiserror::Error;

use crate::env::EnvMap;
use crate::identity::WorkerIdentity;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Execution exceeded the wall-clock timeout.
    #[error("Execution timeout")]
    Timeout,

    /// Worker process failed to start or exited before becoming ready.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// Process exited with non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The worker answered with something that is not a response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Everything a runner needs to start or reuse a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Identity of the worker
    pub identity: WorkerIdentity,
    /// Worker directory, used as the working directory
    pub work_dir: PathBuf,
    /// Materialized entry file inside `work_dir`
    pub entry: PathBuf,
    /// Merged environment (base plus deployment overrides)
    pub env: Arc<EnvMap>,
    /// Memory ceiling in MiB
    pub memory_mb: u32,
    /// Wall-clock execution timeout
    pub timeout: Duration,
}

/// An inbound request forwarded to a worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: Method,
    /// Path plus query string, as received.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A worker's response. The body may still be streaming.
pub struct WorkerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for WorkerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Trait for worker runners.
///
/// Runners only execute: materialization, environment resolution and
/// coordination with the reaper are handled by the caller.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Runner type identifier (e.g., "process", "job")
    fn runner_type(&self) -> &'static str;

    /// Start or reuse the worker described by `spec` and forward `request`.
    ///
    /// Must fail with [`RunnerError::Timeout`] once `spec.timeout` elapses.
    async fn execute(&self, spec: &WorkerSpec, request: WorkerRequest) -> Result<WorkerResponse>;

    /// Stop any long-lived worker for `identity`. Called before its
    /// directory is removed.
    async fn release(&self, identity: &WorkerIdentity) -> Result<()> {
        let _ = identity;
        Ok(())
    }

    /// Stop every worker.
    async fn shutdown(&self) {}

    /// Number of live long-lived workers.
    fn active_workers(&self) -> usize {
        0
    }
}
