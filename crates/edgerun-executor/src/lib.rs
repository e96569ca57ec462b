// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgerun Executor - function execution service
//!
//! Receives function requests from the gateway and runs them in isolated
//! worker processes:
//!
//! ```text
//! gateway ──▶ server ──▶ WorkerSupervisor ──▶ WorkerRunner ──▶ worker process
//!                          │        ▲
//!                 materialize       │ lease / gate
//!                 (object store)    │
//!                          ▼        │
//!              {workers_root}/{project}/{deployment}/{hash}/entry.*
//!                          ▲
//!                StaleWorkerReaper (periodic sweep)
//! ```
//!
//! # Modules
//!
//! - [`identity`]: Worker identity and directory layout
//! - [`materialize`]: Fetching function sources into worker directories
//! - [`env`]: Deployment environment overrides
//! - [`registry`]: Per-identity leases and state gates
//! - [`runner`]: Process, job and mock runners
//! - [`supervisor`]: Request to worker dispatch
//! - [`reaper`]: Stale worker directory removal
//! - [`logs`]: Worker output fan-out
//! - [`server`]: Axum router
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`config`]: Environment configuration

/// Configuration loaded from environment variables.
pub mod config;

/// Deployment environment resolution.
pub mod env;

/// Error types and their HTTP mapping.
pub mod error;

/// Worker identity.
pub mod identity;

/// Worker output fan-out.
pub mod logs;

/// Function source materialization.
pub mod materialize;

/// Stale worker reaper.
pub mod reaper;

/// Per-identity coordination.
pub mod registry;

/// Worker runners.
pub mod runner;

/// Embeddable runtime.
pub mod runtime;

/// Axum router and request dispatch.
pub mod server;

/// Worker supervisor.
pub mod supervisor;

pub use error::{ExecutorError, Result};
pub use runtime::ExecutorRuntime;
