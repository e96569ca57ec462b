// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgerun Gateway - inbound data plane
//!
//! The gateway receives every tenant request and decides where it goes:
//!
//! ```text
//! request ──▶ ManifestResolver ──▶ match_route ──┬──▶ FunctionProxy ──▶ executor
//!             (Host → deployment)                 └──▶ StaticAssetServer ──▶ object store
//! ```
//!
//! # Modules
//!
//! - [`resolver`]: Host normalization, control-plane lookup, binding cache
//! - [`static_assets`]: Fallback chain, content types, on-the-fly gzip
//! - [`proxy`]: Streaming bridge to the function execution service
//! - [`server`]: Axum router
//! - [`runtime`]: Embeddable runtime with graceful shutdown
//! - [`config`]: Environment configuration

/// Configuration loaded from environment variables.
pub mod config;

/// Error types and their HTTP mapping.
pub mod error;

/// Function proxy and streaming sessions.
pub mod proxy;

/// Host to deployment resolution.
pub mod resolver;

/// Embeddable runtime.
pub mod runtime;

/// Axum router and request dispatch.
pub mod server;

/// Static asset delivery.
pub mod static_assets;

pub use error::{GatewayError, Result};
pub use runtime::GatewayRuntime;
