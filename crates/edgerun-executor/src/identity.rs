// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker identity.
//!
//! A worker is identified by `(project_id, deployment_id, function_hash)`,
//! which maps 1:1 to the directory
//! `{workers_root}/{project_id}/{deployment_id}/{function_hash}/`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ExecutorError, Result};

/// Length of the hex function hash.
pub const FUNCTION_HASH_LEN: usize = 16;

const MAX_COMPONENT_LEN: usize = 128;

/// Deterministic hash of a function path: the first 16 hex characters of
/// its SHA-256 digest. Depends only on the path, never on the code.
pub fn function_hash(function_path: &str) -> String {
    let digest = Sha256::digest(function_path.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(FUNCTION_HASH_LEN);
    hash
}

/// Whether `value` can be used as a single directory name.
pub fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_COMPONENT_LEN
        && value != "."
        && value != ".."
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn checked(kind: &str, value: &str) -> Result<String> {
    if is_safe_component(value) {
        Ok(value.to_string())
    } else {
        Err(ExecutorError::BadRequest(format!("invalid {kind}: {value:?}")))
    }
}

/// Identity of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub project_id: String,
    pub deployment_id: String,
    pub function_hash: String,
}

impl WorkerIdentity {
    /// Derive the identity of `function_path` within a deployment.
    pub fn new(project_id: &str, deployment_id: &str, function_path: &str) -> Result<Self> {
        Ok(Self {
            project_id: checked("project id", project_id)?,
            deployment_id: checked("deployment id", deployment_id)?,
            function_hash: function_hash(function_path),
        })
    }

    /// Rebuild an identity from the three directory names of a worker
    /// directory. `None` if any of them could not have been produced by
    /// [`WorkerIdentity::new`].
    pub fn from_components(project_id: &str, deployment_id: &str, function_hash: &str) -> Option<Self> {
        let hash_ok = function_hash.len() == FUNCTION_HASH_LEN
            && function_hash.bytes().all(|b| b.is_ascii_hexdigit());
        (is_safe_component(project_id) && is_safe_component(deployment_id) && hash_ok).then(|| {
            Self {
                project_id: project_id.to_string(),
                deployment_id: deployment_id.to_string(),
                function_hash: function_hash.to_string(),
            }
        })
    }

    /// Working directory of this worker.
    pub fn dir(&self, workers_root: &Path) -> PathBuf {
        workers_root
            .join(&self.project_id)
            .join(&self.deployment_id)
            .join(&self.function_hash)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.project_id, self.deployment_id, self.function_hash
        )
    }
}
