// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervisor.
//!
//! Turns one function request into a worker execution:
//!
//! 1. derive the identity and worker directory from the function path
//! 2. take a lease, and under the identity's gate materialize the function
//!    source if the directory has no entry file
//! 3. resolve the deployment environment
//! 4. hand the request to the runner and stream its response back
//! 5. record the access for the reaper
//!
//! The lease is held until the response body is dropped, so the reaper never
//! removes a directory that is serving a response.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONNECTION, TRANSFER_ENCODING};
use axum::http::{HeaderMap, Response};
use edgerun_core::ObjectStore;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::env::{DeploymentEnv, EnvMap};
use crate::error::{ExecutorError, Result};
use crate::identity::WorkerIdentity;
use crate::materialize;
use crate::registry::{WorkerRegistry, WorkerState};
use crate::runner::{WorkerRequest, WorkerRunner, WorkerSpec};

/// Configuration for [`WorkerSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root of the worker directory tree.
    pub workers_root: PathBuf,
    /// Memory ceiling handed to every worker, in MiB.
    pub memory_mb: u32,
    /// Wall-clock limit of one execution.
    pub execution_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers_root: PathBuf::from(".data/workers"),
            memory_mb: 128,
            execution_timeout: Duration::from_secs(30),
        }
    }
}

/// Function path relative to the deployment.
///
/// Accepts both `deployments/{deployment_id}/{path}` (as sent by the gateway)
/// and a bare relative path.
pub fn relative_function_path<'a>(deployment_id: &str, function_path: &'a str) -> &'a str {
    let trimmed = function_path.trim_start_matches('/');
    trimmed
        .strip_prefix("deployments/")
        .and_then(|rest| rest.strip_prefix(deployment_id))
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(trimmed)
}

fn check_function_path(function_path: &str) -> Result<()> {
    if function_path.is_empty()
        || function_path.ends_with('/')
        || function_path.split('/').any(|s| s == "..")
    {
        return Err(ExecutorError::BadRequest(format!(
            "invalid function path: {:?}",
            function_path
        )));
    }
    Ok(())
}

/// Supervises worker directories and executions.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    store: Arc<dyn ObjectStore>,
    env: DeploymentEnv,
    registry: WorkerRegistry,
    runner: Arc<dyn WorkerRunner>,
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn WorkerRunner>,
        base_env: EnvMap,
    ) -> Self {
        Self {
            env: DeploymentEnv::new(base_env, store.clone()),
            config,
            store,
            registry: WorkerRegistry::new(),
            runner,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn env(&self) -> &DeploymentEnv {
        &self.env
    }

    pub fn runner(&self) -> &Arc<dyn WorkerRunner> {
        &self.runner
    }

    pub fn workers_root(&self) -> &Path {
        &self.config.workers_root
    }

    /// Run `function_path` of a deployment against `request`.
    pub async fn dispatch(
        &self,
        deployment_id: &str,
        project_id: &str,
        function_path: &str,
        request: WorkerRequest,
    ) -> Result<Response<Body>> {
        check_function_path(function_path)?;
        let identity = WorkerIdentity::new(project_id, deployment_id, function_path)?;
        let dir = identity.dir(&self.config.workers_root);

        let lease = self.registry.acquire(&identity);

        let entry = {
            let guard = lease.lock().await;
            match materialize::find_entry(&dir).await {
                Some(entry) => {
                    if guard.state() != WorkerState::Ready {
                        guard.set_state(WorkerState::Ready);
                    }
                    entry
                }
                None => {
                    guard.set_state(WorkerState::Materializing);
                    match materialize::materialize(
                        self.store.as_ref(),
                        &dir,
                        deployment_id,
                        function_path,
                    )
                    .await
                    {
                        Ok(entry) => {
                            guard.set_state(WorkerState::Ready);
                            entry
                        }
                        Err(e) => {
                            guard.set_state(WorkerState::Absent);
                            error!(worker = %identity, error = %e, "Materialization failed");
                            return Err(e);
                        }
                    }
                }
            }
        };

        let env = self.env.resolve(deployment_id).await;
        let spec = WorkerSpec {
            identity: identity.clone(),
            work_dir: dir,
            entry,
            env,
            memory_mb: self.config.memory_mb,
            timeout: self.config.execution_timeout,
        };

        debug!(
            worker = %identity,
            method = %request.method,
            path = %request.path_and_query,
            runner = self.runner.runner_type(),
            "Dispatching to worker"
        );

        let response = match self.runner.execute(&spec, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(worker = %identity, error = %e, "Worker execution failed");
                return Err(e.into());
            }
        };

        lease.touch();
        if let Err(e) = materialize::touch(&spec.entry).await {
            warn!(worker = %identity, error = %e, "Failed to touch entry file");
        }

        info!(worker = %identity, status = %response.status, "Worker responded");

        // The lease lives as long as the body stream
        let body = response.body.map(move |chunk| {
            let _ = &lease;
            chunk
        });
        let mut reply = Response::new(Body::from_stream(body));
        *reply.status_mut() = response.status;
        *reply.headers_mut() = response_headers(response.headers);
        Ok(reply)
    }
}

fn response_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    headers.remove("keep-alive");
    headers
}
