// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function code materialization.
//!
//! The function source is fetched from the object store and written to a
//! temporary file in the worker directory, then renamed to `entry.<ext>`.
//! A directory therefore either holds a complete entry file or none at all.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use edgerun_core::ObjectStore;
use edgerun_core::object_store::deployment_key;
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};

const ENTRY_STEM: &str = "entry";
const DEFAULT_EXTENSION: &str = "js";

/// File name of the materialized entry for `function_path`.
pub fn entry_file_name(function_path: &str) -> String {
    let ext = Path::new(function_path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.bytes().all(|b| b.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_EXTENSION);
    format!("{ENTRY_STEM}.{ext}")
}

/// Locate a materialized entry file in `dir`.
pub async fn find_entry(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let is_entry = name
            .to_str()
            .and_then(|n| n.strip_prefix(ENTRY_STEM))
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1);
        if is_entry && entry.file_type().await.is_ok_and(|t| t.is_file()) {
            return Some(entry.path());
        }
    }
    None
}

/// Fetch `function_path` of `deployment_id` into `dir`.
///
/// The caller must hold the identity's lock.
pub async fn materialize(
    store: &dyn ObjectStore,
    dir: &Path,
    deployment_id: &str,
    function_path: &str,
) -> Result<PathBuf> {
    let key = deployment_key(deployment_id, function_path);
    let failed = |reason: String| ExecutorError::CodeMaterialization {
        key: key.clone(),
        reason,
    };

    let source = match store.get_bytes(&key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(failed("object not found".to_string())),
        Err(e) => return Err(failed(e.to_string())),
    };

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| failed(format!("create {}: {e}", dir.display())))?;

    let entry = dir.join(entry_file_name(function_path));
    let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, &source).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(failed(format!("write {}: {e}", tmp.display())));
    }
    if let Err(e) = tokio::fs::rename(&tmp, &entry).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(failed(format!("rename to {}: {e}", entry.display())));
    }

    info!(
        key = %key,
        entry = %entry.display(),
        bytes = source.len(),
        "Materialized function"
    );
    Ok(entry)
}

/// Set the entry file's access and modification times to now.
pub async fn touch(entry: &Path) -> std::io::Result<()> {
    let entry = entry.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let now = SystemTime::now();
        let file = std::fs::OpenOptions::new().append(true).open(&entry)?;
        file.set_times(
            std::fs::FileTimes::new()
                .set_accessed(now)
                .set_modified(now),
        )?;
        debug!(entry = %entry.display(), "Touched entry file");
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Most recent access or modification time of `entry`.
///
/// Falls back to "now" when the filesystem reports neither.
pub async fn last_used(entry: &Path) -> std::io::Result<SystemTime> {
    let metadata = tokio::fs::metadata(entry).await?;
    let accessed = metadata.accessed().ok();
    let modified = metadata.modified().ok();
    Ok(accessed
        .into_iter()
        .chain(modified)
        .max()
        .unwrap_or_else(SystemTime::now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerun_core::object_store::MemoryObjectStore;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_entry_file_name() {
        assert_eq!(entry_file_name("api/users.js"), "entry.js");
        assert_eq!(entry_file_name("api/users.mjs"), "entry.mjs");
        assert_eq!(entry_file_name("api/users"), "entry.js");
        assert_eq!(entry_file_name("api/users.j$"), "entry.js");
    }

    #[tokio::test]
    async fn test_materialize_writes_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryObjectStore::new();
        store.insert("deployments/d1/api/users.js", "module.exports = 1;");
        let dir = temp_dir.path().join("p1/d1/abc");

        let entry = materialize(&store, &dir, "d1", "api/users.js").await.unwrap();

        assert_eq!(entry, dir.join("entry.js"));
        assert_eq!(std::fs::read_to_string(&entry).unwrap(), "module.exports = 1;");
        assert_eq!(find_entry(&dir).await, Some(entry));
        // No temporary files left behind
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_materialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryObjectStore::new();
        let dir = temp_dir.path().join("p1/d1/abc");

        let err = materialize(&store, &dir, "d1", "api/nope.js")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::CodeMaterialization { .. }));
        assert!(find_entry(&dir).await.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_materialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryObjectStore::new();
        store.fail_key("deployments/d1/f.js");

        let err = materialize(&store, temp_dir.path(), "d1", "f.js")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deployments/d1/f.js"));
    }

    #[tokio::test]
    async fn test_find_entry_ignores_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(".partial.tmp"), "x").unwrap();
        std::fs::write(temp_dir.path().join("entry"), "x").unwrap();
        assert!(find_entry(temp_dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn test_touch_refreshes_last_used() {
        let temp_dir = TempDir::new().unwrap();
        let entry = temp_dir.path().join("entry.js");
        std::fs::write(&entry, "x").unwrap();

        let old = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .append(true)
            .open(&entry)
            .unwrap()
            .set_times(std::fs::FileTimes::new().set_accessed(old).set_modified(old))
            .unwrap();
        assert!(last_used(&entry).await.unwrap() < SystemTime::now() - Duration::from_secs(60));

        touch(&entry).await.unwrap();
        assert!(last_used(&entry).await.unwrap() > SystemTime::now() - Duration::from_secs(60));
    }
}
