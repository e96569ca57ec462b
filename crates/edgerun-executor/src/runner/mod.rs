// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - worker execution backends.
//!
//! - [`ProcessRunner`]: one long-lived worker process per identity, reached
//!   over loopback HTTP
//! - [`JobRunner`]: one short-lived process per request, JSON over stdio
//! - [`MockRunner`]: test double

mod command;
pub mod job;
pub mod mock;
pub mod process;
mod traits;

pub use command::WorkerCommand;
pub use job::JobRunner;
pub use mock::MockRunner;
pub use process::ProcessRunner;
pub use traits::*;
