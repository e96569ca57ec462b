// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgerun Core - shared data plane types
//!
//! This crate holds the pieces that both the gateway (inbound traffic) and the
//! executor (function execution) depend on:
//!
//! ```text
//!            ┌──────────────────────┐        ┌────────────────────────┐
//!  client ──▶│   edgerun-gateway    │──HTTP─▶│    edgerun-executor    │
//!            │ resolve/match/serve  │        │ supervisor/reaper      │
//!            └──────────┬───────────┘        └───────────┬────────────┘
//!                       │                                │
//!                       ▼                                ▼
//!            ┌──────────────────────────────────────────────────────────┐
//!            │                 edgerun-core (this crate)                │
//!            │   Manifest / Resource   Route Matcher   ObjectStore      │
//!            └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`manifest`]: Deployment manifests and their validation
//! - [`routing`]: Path normalization, pattern matching, and route scoring
//! - [`object_store`]: Key-addressed object access (HTTP, filesystem, memory)
//! - [`headers`]: Header names shared between gateway and executor
//! - [`error`]: Error types for this crate

/// Header names exchanged between gateway and executor.
pub mod headers;

/// Error types for manifest parsing and object store access.
pub mod error;

/// Deployment manifests: tagged static/dynamic resources.
pub mod manifest;

/// Route matching with specificity scoring.
pub mod routing;

/// Object store client contract and implementations.
pub mod object_store;

pub use error::{ManifestError, ObjectStoreError};
pub use manifest::{Manifest, Resource};
pub use object_store::{ObjectStore, StoredObject};
