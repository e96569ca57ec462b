// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem object store backend.
//!
//! Keys map to files below a root directory. Used for local development and
//! for single-node installs where bundles are unpacked on disk.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;

use super::{ObjectStore, StoredObject};
use crate::error::{ObjectStoreError, Result};

/// Object store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

/// Format a timestamp as an RFC 7231 HTTP-date.
pub(crate) fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl FsObjectStore {
    /// Create a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path below the root, rejecting anything that
    /// would escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(ObjectStoreError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn backend_type(&self) -> &'static str {
        "fs"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.resolve(key)?;

        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let len = metadata.len();
        let (etag, last_modified) = match metadata.modified() {
            Ok(modified) => {
                let modified = DateTime::<Utc>::from(modified);
                let mut hasher = Sha256::new();
                hasher.update(len.to_le_bytes());
                hasher.update(modified.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
                let digest = hex::encode(hasher.finalize());
                (
                    Some(format!("W/\"{}\"", &digest[..16])),
                    Some(http_date(modified)),
                )
            }
            Err(_) => (None, None),
        };

        Ok(Some(StoredObject {
            body: ReaderStream::new(file).boxed(),
            content_length: Some(len),
            content_type: None,
            etag,
            last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("deployments/d1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("app.js"), b"console.log(1)").unwrap();

        let store = FsObjectStore::new(temp_dir.path());
        let object = store.get("deployments/d1/app.js").await.unwrap().unwrap();

        assert_eq!(object.content_length, Some(14));
        assert!(object.etag.as_deref().unwrap().starts_with("W/\""));
        assert!(object.last_modified.as_deref().unwrap().ends_with("GMT"));
        let bytes = object.into_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"console.log(1)");
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path());
        assert!(store.get("deployments/d1/nope.js").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_is_none() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("deployments/d1")).unwrap();
        let store = FsObjectStore::new(temp_dir.path());
        assert!(store.get("deployments/d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(temp_dir.path());
        assert!(matches!(
            store.get("deployments/../../etc/passwd").await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_http_date_format() {
        let time = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(http_date(time), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
