// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP object store backend (S3-style `GET {base}/{key}`).

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{StatusCode, Url};
use tracing::debug;

use super::{ObjectStore, StoredObject};
use crate::error::{ObjectStoreError, Result};

/// Object store reached over plain HTTP.
///
/// The client is injected so connection pools are shared with the rest of the
/// process.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: Url,
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl HttpObjectStore {
    /// Create a backend rooted at `base_url`.
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ObjectStoreError::Config(format!("invalid base URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ObjectStoreError::Config(format!(
                "base URL {base_url} cannot carry a path"
            )));
        }
        Ok(Self { client, base_url })
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        if key.is_empty() {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ObjectStoreError::InvalidKey(key.to_string()))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    fn backend_type(&self) -> &'static str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let url = self.object_url(key)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!(key = %key, "Object not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                status: status.as_u16(),
                key: key.to_string(),
            });
        }

        let headers = response.headers();
        let content_type = header_string(headers, CONTENT_TYPE);
        let etag = header_string(headers, ETAG);
        let last_modified = header_string(headers, LAST_MODIFIED);
        let content_length = response.content_length();

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(Some(StoredObject {
            body,
            content_length,
            content_type,
            etag,
            last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_keeps_base_path() {
        let store =
            HttpObjectStore::new(reqwest::Client::new(), "http://store.local/bucket/").unwrap();
        let url = store.object_url("deployments/d1/app.js").unwrap();
        assert_eq!(url.as_str(), "http://store.local/bucket/deployments/d1/app.js");
    }

    #[test]
    fn test_object_url_encodes_segments() {
        let store = HttpObjectStore::new(reqwest::Client::new(), "http://store.local").unwrap();
        let url = store.object_url("deployments/d1/my file.txt").unwrap();
        assert_eq!(url.as_str(), "http://store.local/deployments/d1/my%20file.txt");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpObjectStore::new(reqwest::Client::new(), "not a url").is_err());
    }
}
