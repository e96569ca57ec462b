// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for edgerun-executor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use edgerun_core::ObjectStoreError;
use edgerun_core::object_store::ObjectStoreConfig;

use crate::runner::WorkerCommand;

/// Which runner executes functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// One long-lived worker process per function
    Process,
    /// One process per request
    Job,
}

impl FromStr for RunnerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "job" => Ok(Self::Job),
            _ => Err(()),
        }
    }
}

/// Executor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Root of the worker directory tree
    pub workers_root: PathBuf,
    /// Runner implementation
    pub runner: RunnerKind,
    /// How workers are started
    pub worker_command: WorkerCommand,
    /// Memory ceiling per worker, in MiB
    pub memory_mb: u32,
    /// Wall-clock limit of one execution
    pub execution_timeout: Duration,
    /// How often the reaper sweeps
    pub reaper_interval: Duration,
    /// Idle time after which a worker directory is removed
    pub reaper_max_age: Duration,
    /// Where function sources are read from
    pub object_store: ObjectStoreConfig,
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("EDGERUN_EXECUTOR_PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let workers_root = std::env::var("EDGERUN_WORKERS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data/workers"));

        let runner = env_or("EDGERUN_RUNNER", RunnerKind::Process)?;

        let default_command = WorkerCommand::default();
        let worker_command = match (
            std::env::var("EDGERUN_WORKER_COMMAND"),
            std::env::var("EDGERUN_WORKER_ARGS"),
        ) {
            (Err(_), Err(_)) => default_command,
            (program, args) => WorkerCommand::parse(
                program.unwrap_or(default_command.program),
                &args.unwrap_or_else(|_| default_command.args.join(" ")),
            ),
        };

        let memory_mb = env_or("EDGERUN_WORKER_MEMORY_MB", 128)?;
        let execution_timeout =
            Duration::from_secs(env_or("EDGERUN_EXECUTION_TIMEOUT_SECS", 30)?);
        let reaper_interval = Duration::from_secs(env_or("EDGERUN_REAPER_INTERVAL_SECS", 300)?);
        let reaper_max_age =
            Duration::from_secs(env_or::<u64>("EDGERUN_REAPER_MAX_AGE_MINUTES", 30)? * 60);

        let object_store = ObjectStoreConfig::from_env()?;

        Ok(Self {
            bind_addr,
            workers_root,
            runner,
            worker_command,
            memory_mb,
            execution_timeout,
            reaper_interval,
            reaper_max_age,
            object_store,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// Object store settings are missing or conflicting.
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_kind_parse() {
        assert_eq!("process".parse(), Ok(RunnerKind::Process));
        assert_eq!(" JOB ".parse(), Ok(RunnerKind::Job));
        assert!("docker".parse::<RunnerKind>().is_err());
    }
}
