// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object store access.
//!
//! Deployment bundles live in a key-addressed object store. Keys follow one
//! convention for both static assets and function code:
//!
//! - `deployments/{deployment_id}/{relative_path}` - assets and function sources
//! - `deployments/{deployment_id}/metadata.json` - per-deployment environment
//!
//! Objects are returned as streams so large assets never sit in memory.

mod fs;
mod http;
mod memory;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;
pub use memory::MemoryObjectStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{ObjectStoreError, Result};

/// Streamed object body.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An object fetched from the store.
pub struct StoredObject {
    /// Object bytes, in order.
    pub body: ByteStream,
    /// Size in bytes, if the backend knows it.
    pub content_length: Option<u64>,
    /// Content type recorded by the backend.
    pub content_type: Option<String>,
    /// Entity tag, quoted as it should appear in an `ETag` header.
    pub etag: Option<String>,
    /// HTTP-date of the last modification.
    pub last_modified: Option<String>,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

impl StoredObject {
    /// Wrap an in-memory buffer.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let content_length = Some(bytes.len() as u64);
        Self {
            body: futures::stream::once(async move { Ok(bytes) }).boxed(),
            content_length,
            content_type: None,
            etag: None,
            last_modified: None,
        }
    }

    /// Drain the body into a single buffer.
    pub async fn into_bytes(mut self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Key-addressed, read-only object access.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend identifier (e.g. "http", "fs", "memory").
    fn backend_type(&self) -> &'static str;

    /// Fetch an object. `Ok(None)` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Fetch a whole object into memory. Meant for small objects only.
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        match self.get(key).await? {
            Some(object) => Ok(Some(object.into_bytes().await?)),
            None => Ok(None),
        }
    }
}

/// Object key of a deployment file.
pub fn deployment_key(deployment_id: &str, relative_path: &str) -> String {
    format!(
        "deployments/{}/{}",
        deployment_id,
        relative_path.trim_start_matches('/')
    )
}

/// Object key of a deployment's metadata document.
pub fn metadata_key(deployment_id: &str) -> String {
    deployment_key(deployment_id, "metadata.json")
}

/// Which backend to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreConfig {
    /// HTTP endpoint serving `GET {base_url}/{key}`.
    Http {
        /// Base URL of the store.
        base_url: String,
    },
    /// Local directory; keys are relative paths below it.
    Filesystem {
        /// Root directory.
        root: PathBuf,
    },
}

impl ObjectStoreConfig {
    /// Load from `EDGERUN_OBJECT_STORE_URL` or `EDGERUN_OBJECT_STORE_DIR`.
    ///
    /// Exactly one of the two must be set.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("EDGERUN_OBJECT_STORE_URL").ok();
        let dir = std::env::var("EDGERUN_OBJECT_STORE_DIR").ok();

        match (url, dir) {
            (Some(base_url), None) => Ok(Self::Http { base_url }),
            (None, Some(root)) => Ok(Self::Filesystem {
                root: PathBuf::from(root),
            }),
            (Some(_), Some(_)) => Err(ObjectStoreError::Config(
                "set only one of EDGERUN_OBJECT_STORE_URL and EDGERUN_OBJECT_STORE_DIR".to_string(),
            )),
            (None, None) => Err(ObjectStoreError::Config(
                "EDGERUN_OBJECT_STORE_URL or EDGERUN_OBJECT_STORE_DIR is required".to_string(),
            )),
        }
    }

    /// Build the configured backend, sharing `client` for HTTP access.
    pub fn build(&self, client: reqwest::Client) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Http { base_url } => Ok(Arc::new(HttpObjectStore::new(client, base_url)?)),
            Self::Filesystem { root } => Ok(Arc::new(FsObjectStore::new(root.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_key() {
        assert_eq!(
            deployment_key("d1", "/app/index.html"),
            "deployments/d1/app/index.html"
        );
        assert_eq!(deployment_key("d1", "api/x.js"), "deployments/d1/api/x.js");
        assert_eq!(metadata_key("d1"), "deployments/d1/metadata.json");
    }

    #[tokio::test]
    async fn test_into_bytes_collects_chunks() {
        let object = StoredObject {
            body: futures::stream::iter(vec![
                Ok(Bytes::from_static(b"ab")),
                Ok(Bytes::from_static(b"c")),
            ])
            .boxed(),
            content_length: None,
            content_type: None,
            etag: None,
            last_modified: None,
        };
        assert_eq!(object.into_bytes().await.unwrap(), Bytes::from_static(b"abc"));
    }
}
