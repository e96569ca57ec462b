// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgerun Executor - function execution service
//!
//! An HTTP server responsible for:
//! - Materializing function sources into worker directories
//! - Running functions in isolated worker processes
//! - Removing worker directories that went stale

use std::sync::Arc;
use tracing::{info, warn};

use edgerun_executor::config::{Config, RunnerKind};
use edgerun_executor::logs::LogHub;
use edgerun_executor::runner::process::ProcessRunnerConfig;
use edgerun_executor::runner::{JobRunner, ProcessRunner, WorkerRunner};
use edgerun_executor::runtime::ExecutorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edgerun_executor=info,tower_http=info".into());
    if std::env::var("EDGERUN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        workers_root = %config.workers_root.display(),
        runner = ?config.runner,
        worker_command = %config.worker_command.program,
        memory_mb = config.memory_mb,
        execution_timeout_secs = config.execution_timeout.as_secs(),
        "Starting Edgerun Executor"
    );

    tokio::fs::create_dir_all(&config.workers_root).await?;

    let client = reqwest::Client::builder().build()?;
    let object_store = config.object_store.build(client)?;
    info!(backend = object_store.backend_type(), "Object store initialized");

    let logs = LogHub::default();
    let runner: Arc<dyn WorkerRunner> = match config.runner {
        RunnerKind::Process => Arc::new(ProcessRunner::new(
            ProcessRunnerConfig {
                command: config.worker_command.clone(),
                ..Default::default()
            },
            logs.clone(),
        )?),
        RunnerKind::Job => Arc::new(JobRunner::new(config.worker_command.clone(), logs.clone())),
    };
    info!(runner = runner.runner_type(), "Runner initialized");

    let runtime = ExecutorRuntime::builder()
        .object_store(object_store)
        .runner(runner)
        .log_hub(logs)
        .bind_addr(config.bind_addr)
        .workers_root(config.workers_root.clone())
        .memory_mb(config.memory_mb)
        .execution_timeout(config.execution_timeout)
        .reaper_interval(config.reaper_interval)
        .reaper_max_age(config.reaper_max_age)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Executor ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Edgerun Executor shut down");

    Ok(())
}
