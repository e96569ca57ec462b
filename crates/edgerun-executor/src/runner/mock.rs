// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! A simple runner implementation that records what it was asked to run
//! and answers without starting any process.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::traits::*;
use crate::env::EnvMap;
use crate::identity::WorkerIdentity;

/// One recorded `execute` call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub identity: WorkerIdentity,
    pub entry: PathBuf,
    pub env: Arc<EnvMap>,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Entry file contents at the time of the call.
    pub source: Option<String>,
}

/// Mock runner for testing.
pub struct MockRunner {
    calls: Arc<Mutex<Vec<MockCall>>>,
    released: Arc<Mutex<Vec<WorkerIdentity>>>,
    live: Arc<Mutex<HashSet<WorkerIdentity>>>,
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, every execution fails to start
    pub fail_by_default: bool,
    /// If true, executions run until the spec timeout and then time out.
    /// This is useful for testing timeout enforcement.
    pub never_complete: bool,
    /// Response body chunks, sent in order
    pub chunks: Vec<Bytes>,
    /// Response status
    pub status: StatusCode,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner answering `200 ok`.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(Mutex::new(HashSet::new())),
            execution_delay_ms: 0,
            fail_by_default: false,
            never_complete: false,
            chunks: vec![Bytes::from_static(b"ok")],
            status: StatusCode::OK,
        }
    }

    /// Create a mock runner whose workers fail to start.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock runner whose executions never finish on their own.
    pub fn never_completing() -> Self {
        Self {
            never_complete: true,
            ..Self::new()
        }
    }

    /// Answer with `status` and the given body chunks.
    pub fn with_response(mut self, status: StatusCode, chunks: Vec<Bytes>) -> Self {
        self.status = status;
        self.chunks = chunks;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.execution_delay_ms = delay_ms;
        self
    }

    /// Calls made so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Identities released so far, in order.
    pub async fn released(&self) -> Vec<WorkerIdentity> {
        self.released.lock().await.clone()
    }
}

#[async_trait]
impl WorkerRunner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, spec: &WorkerSpec, request: WorkerRequest) -> Result<WorkerResponse> {
        let source = tokio::fs::read_to_string(&spec.entry).await.ok();
        self.calls.lock().await.push(MockCall {
            identity: spec.identity.clone(),
            entry: spec.entry.clone(),
            env: spec.env.clone(),
            method: request.method,
            path_and_query: request.path_and_query,
            headers: request.headers,
            body: request.body,
            source,
        });

        if self.fail_by_default {
            return Err(RunnerError::StartFailed("mock failure".to_string()));
        }

        if self.never_complete {
            tokio::time::sleep(spec.timeout).await;
            return Err(RunnerError::Timeout);
        }

        // Simulate execution
        if self.execution_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.execution_delay_ms)).await;
        }

        self.live.lock().await.insert(spec.identity.clone());

        let mut headers = HeaderMap::new();
        headers.insert("x-mock-runner", HeaderValue::from_static("1"));
        let chunks = self.chunks.clone();

        Ok(WorkerResponse {
            status: self.status,
            headers,
            body: futures::stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }

    async fn release(&self, identity: &WorkerIdentity) -> Result<()> {
        self.live.lock().await.remove(identity);
        self.released.lock().await.push(identity.clone());
        Ok(())
    }

    async fn shutdown(&self) {
        self.live.lock().await.clear();
    }

    fn active_workers(&self) -> usize {
        self.live.try_lock().map(|live| live.len()).unwrap_or(0)
    }
}
