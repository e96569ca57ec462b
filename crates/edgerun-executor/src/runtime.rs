// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for edgerun-executor.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edgerun_core::object_store::FsObjectStore;
//! use edgerun_executor::logs::LogHub;
//! use edgerun_executor::runner::{JobRunner, WorkerCommand};
//! use edgerun_executor::runtime::ExecutorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let logs = LogHub::default();
//!     let runner = JobRunner::new(WorkerCommand::parse("node", "{entry}"), logs.clone());
//!
//!     let runtime = ExecutorRuntime::builder()
//!         .object_store(Arc::new(FsObjectStore::new("/srv/bundles")))
//!         .runner(Arc::new(runner))
//!         .log_hub(logs)
//!         .workers_root("/var/lib/edgerun/workers")
//!         .bind_addr("127.0.0.1:8090".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use edgerun_core::ObjectStore;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::env::EnvMap;
use crate::logs::LogHub;
use crate::reaper::{ReaperConfig, StaleWorkerReaper};
use crate::runner::WorkerRunner;
use crate::server::{DEFAULT_MAX_REQUEST_BODY_BYTES, ExecutorState, router};
use crate::supervisor::{SupervisorConfig, WorkerSupervisor};

/// Builder for creating an [`ExecutorRuntime`].
pub struct ExecutorRuntimeBuilder {
    object_store: Option<Arc<dyn ObjectStore>>,
    runner: Option<Arc<dyn WorkerRunner>>,
    log_hub: Option<LogHub>,
    base_env: Option<EnvMap>,
    bind_addr: SocketAddr,
    workers_root: PathBuf,
    memory_mb: u32,
    execution_timeout: Duration,
    reaper_interval: Duration,
    reaper_max_age: Duration,
    max_request_body_bytes: usize,
}

impl Default for ExecutorRuntimeBuilder {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        let reaper = ReaperConfig::default();
        Self {
            object_store: None,
            runner: None,
            log_hub: None,
            base_env: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            workers_root: supervisor.workers_root,
            memory_mb: supervisor.memory_mb,
            execution_timeout: supervisor.execution_timeout,
            reaper_interval: reaper.poll_interval,
            reaper_max_age: reaper.max_age,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }
}

impl ExecutorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the object store holding function sources (required).
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Set the runner executing functions (required).
    pub fn runner(mut self, runner: Arc<dyn WorkerRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the hub worker output is published on. Pass the same hub the
    /// runner was created with.
    ///
    /// Default: a fresh hub
    pub fn log_hub(mut self, hub: LogHub) -> Self {
        self.log_hub = Some(hub);
        self
    }

    /// Set the base environment of every worker.
    ///
    /// Default: the environment of this process
    pub fn base_env(mut self, env: EnvMap) -> Self {
        self.base_env = Some(env);
        self
    }

    /// Set the listen address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8090`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the root of the worker directory tree.
    ///
    /// Default: `.data/workers`
    pub fn workers_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workers_root = root.into();
        self
    }

    /// Set the memory ceiling per worker, in MiB.
    ///
    /// Default: 128
    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the wall-clock limit of one execution.
    ///
    /// Default: 30 seconds
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Set how often the reaper sweeps.
    ///
    /// Default: 5 minutes
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Set the idle time after which worker directories are removed.
    ///
    /// Default: 30 minutes
    pub fn reaper_max_age(mut self, max_age: Duration) -> Self {
        self.reaper_max_age = max_age;
        self
    }

    /// Set the cap on request bodies.
    ///
    /// Default: 10 MiB
    pub fn max_request_body_bytes(mut self, limit: usize) -> Self {
        self.max_request_body_bytes = limit;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ExecutorRuntimeConfig> {
        let object_store = self
            .object_store
            .ok_or_else(|| anyhow::anyhow!("object_store is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;

        let supervisor = Arc::new(WorkerSupervisor::new(
            SupervisorConfig {
                workers_root: self.workers_root.clone(),
                memory_mb: self.memory_mb,
                execution_timeout: self.execution_timeout,
            },
            object_store,
            runner.clone(),
            self.base_env.unwrap_or_else(|| std::env::vars().collect()),
        ));

        let reaper = StaleWorkerReaper::new(
            ReaperConfig {
                workers_root: self.workers_root,
                poll_interval: self.reaper_interval,
                max_age: self.reaper_max_age,
            },
            supervisor.registry().clone(),
            runner,
        )
        .with_deployment_env(supervisor.env().clone());

        let mut state = ExecutorState::new(supervisor, self.log_hub.unwrap_or_default());
        state.max_request_body_bytes = self.max_request_body_bytes;

        Ok(ExecutorRuntimeConfig {
            state: Arc::new(state),
            reaper,
            bind_addr: self.bind_addr,
        })
    }
}

/// Configuration for an [`ExecutorRuntime`].
pub struct ExecutorRuntimeConfig {
    state: Arc<ExecutorState>,
    reaper: StaleWorkerReaper,
    bind_addr: SocketAddr,
}

impl ExecutorRuntimeConfig {
    /// Bind the listener, start the reaper and start serving.
    pub async fn start(self) -> Result<ExecutorRuntime> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let reaper_shutdown = self.reaper.shutdown_handle();
        let reaper = self.reaper;
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = router(self.state.clone());

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while server_shutdown_rx.changed().await.is_ok() {
                        if *server_shutdown_rx.borrow() {
                            break;
                        }
                    }
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(
            bind_addr = %local_addr,
            runner = self.state.supervisor.runner().runner_type(),
            "ExecutorRuntime started"
        );

        Ok(ExecutorRuntime {
            server_handle,
            server_shutdown_tx,
            reaper_handle,
            reaper_shutdown,
            state: self.state,
            local_addr,
        })
    }
}

/// A running execution service.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ExecutorRuntime {
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    reaper_handle: JoinHandle<()>,
    reaper_shutdown: Arc<Notify>,
    state: Arc<ExecutorState>,
    local_addr: SocketAddr,
}

impl ExecutorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ExecutorRuntimeBuilder {
        ExecutorRuntimeBuilder::new()
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<ExecutorState> {
        &self.state
    }

    /// Check if the server task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Stop serving, stop the reaper, end log streams and stop all workers.
    pub async fn shutdown(self) -> Result<()> {
        info!("ExecutorRuntime shutting down...");

        // Log streams never end on their own
        self.state.logs.close();
        let _ = self.server_shutdown_tx.send(true);
        self.reaper_shutdown.notify_one();

        let server_result = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Executor server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Executor server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        if let Err(e) = self.reaper_handle.await {
            error!("Stale worker reaper panicked: {}", e);
        }

        self.state.supervisor.runner().shutdown().await;

        if server_result.is_ok() {
            info!("ExecutorRuntime shutdown complete");
        }
        server_result
    }
}
