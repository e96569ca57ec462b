// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgerun-core.

use thiserror::Error;

/// Errors raised while parsing or validating a deployment manifest.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The manifest is not valid JSON or does not match the schema.
    #[error("Malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A resource entry failed validation.
    #[error("Invalid resource #{index}: {reason}")]
    InvalidResource {
        /// Position of the entry in `resources`.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Errors raised by object store backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObjectStoreError {
    /// The key is not acceptable to this backend (e.g. escapes the root).
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// HTTP transport failed.
    #[error("Object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with an unexpected status.
    #[error("Object store returned status {status} for {key}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested key.
        key: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is not configured correctly.
    #[error("Object store configuration error: {0}")]
    Config(String),
}

/// Result type for object store operations.
pub type Result<T> = std::result::Result<T, ObjectStoreError>;
