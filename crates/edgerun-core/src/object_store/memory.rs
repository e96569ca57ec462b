// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory object store, used by tests and embedded setups.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{ObjectStore, StoredObject};
use crate::error::{ObjectStoreError, Result};

#[derive(Debug, Clone)]
struct Entry {
    chunks: Vec<Bytes>,
    content_type: Option<String>,
}

/// Object store holding its contents in a map.
///
/// Objects can be stored as several chunks to exercise streaming consumers,
/// and individual keys can be marked as failing.
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Entry>>>,
    failing: Arc<RwLock<HashSet<String>>>,
    fetches: Arc<AtomicUsize>,
    fetches_by_key: Arc<RwLock<HashMap<String, usize>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `body` under `key`, replacing any previous object.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        self.insert_chunked(key, vec![body.into()]);
    }

    /// Store an object with an explicit content type.
    pub fn insert_typed(
        &self,
        key: impl Into<String>,
        body: impl Into<Bytes>,
        content_type: impl Into<String>,
    ) {
        let entry = Entry {
            chunks: vec![body.into()],
            content_type: Some(content_type.into()),
        };
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.into(), entry);
        }
    }

    /// Store an object that will be streamed back as the given chunks.
    pub fn insert_chunked(&self, key: impl Into<String>, chunks: Vec<Bytes>) {
        let entry = Entry {
            chunks,
            content_type: None,
        };
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.into(), entry);
        }
    }

    /// Remove an object.
    pub fn remove(&self, key: &str) {
        if let Ok(mut objects) = self.objects.write() {
            objects.remove(key);
        }
    }

    /// Make every `get` of `key` fail with an I/O error.
    pub fn fail_key(&self, key: impl Into<String>) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(key.into());
        }
    }

    /// Number of `get` calls served so far, including misses.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of `get` calls for `key` so far.
    pub fn fetch_count_for(&self, key: &str) -> usize {
        self.fetches_by_key
            .read()
            .ok()
            .and_then(|counts| counts.get(key).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.fetches_by_key.write() {
            *counts.entry(key.to_string()).or_default() += 1;
        }

        let failing = self
            .failing
            .read()
            .map(|failing| failing.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(ObjectStoreError::Io(std::io::Error::other(format!(
                "injected failure for {key}"
            ))));
        }

        let entry = self
            .objects
            .read()
            .ok()
            .and_then(|objects| objects.get(key).cloned());

        Ok(entry.map(|entry| {
            let content_length = entry.chunks.iter().map(|c| c.len() as u64).sum();
            StoredObject {
                body: futures::stream::iter(entry.chunks.into_iter().map(Ok)).boxed(),
                content_length: Some(content_length),
                content_type: entry.content_type,
                etag: None,
                last_modified: None,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryObjectStore::new();
        store.insert("deployments/d1/a.txt", "hello");

        let bytes = store.get_bytes("deployments/d1/a.txt").await.unwrap();
        assert_eq!(bytes, Some(Bytes::from_static(b"hello")));
        assert!(store.get("deployments/d1/b.txt").await.unwrap().is_none());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_chunked_object_streams_chunks() {
        let store = MemoryObjectStore::new();
        store.insert_chunked(
            "k",
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")],
        );

        let mut object = store.get("k").await.unwrap().unwrap();
        assert_eq!(object.content_length, Some(3));
        let mut chunks = Vec::new();
        while let Some(chunk) = object.body.next().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_key() {
        let store = MemoryObjectStore::new();
        store.insert("k", "v");
        store.fail_key("k");
        assert!(store.get("k").await.is_err());
    }
}
