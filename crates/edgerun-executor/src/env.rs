// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment-scoped worker environment.
//!
//! Workers start from the executor's base environment (captured once at
//! startup) with the deployment's overrides from
//! `deployments/{deployment_id}/metadata.json` on top:
//!
//! ```json
//! { "env": { "API_URL": "https://api.example", "RETRIES": 3 } }
//! ```
//!
//! `environment` and `envVars` are accepted as aliases of `env`. A missing or
//! unreadable metadata object leaves the base environment unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use edgerun_core::ObjectStore;
use edgerun_core::object_store::metadata_key;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Environment variables handed to a worker.
pub type EnvMap = HashMap<String, String>;

#[derive(Debug, Default, Deserialize)]
struct DeploymentMetadata {
    #[serde(default, alias = "environment", alias = "envVars")]
    env: Option<serde_json::Map<String, Value>>,
}

/// Parse environment overrides out of a metadata document.
pub fn parse_overrides(bytes: &[u8]) -> Result<EnvMap, serde_json::Error> {
    let metadata: DeploymentMetadata = serde_json::from_slice(bytes)?;
    Ok(metadata
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Null => return None,
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some((key, value))
        })
        .collect())
}

/// Overlay `overrides` on `base`; overrides win.
pub fn merge(base: &EnvMap, overrides: EnvMap) -> EnvMap {
    let mut merged = base.clone();
    merged.extend(overrides);
    merged
}

/// Resolves and caches the merged environment of each deployment.
///
/// Deployments are immutable, so a successfully loaded environment never
/// changes. Failed loads are not cached. Entries of deployments that no
/// longer have workers are dropped by the stale worker reaper through
/// [`DeploymentEnv::retain`]. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct DeploymentEnv {
    base: Arc<EnvMap>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<DashMap<String, Arc<EnvMap>>>,
}

impl DeploymentEnv {
    pub fn new(base: EnvMap, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            base: Arc::new(base),
            store,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Capture the current process environment as the base.
    pub fn from_process(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(std::env::vars().collect(), store)
    }

    pub fn base(&self) -> &EnvMap {
        &self.base
    }

    /// Whether the environment of `deployment_id` is cached.
    pub fn is_cached(&self, deployment_id: &str) -> bool {
        self.cache.contains_key(deployment_id)
    }

    /// Keep only the cached deployments for which `keep` holds. Returns how
    /// many were dropped.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.cache.len();
        self.cache.retain(|deployment_id, _| keep(deployment_id));
        before.saturating_sub(self.cache.len())
    }

    /// Merged environment for `deployment_id`.
    pub async fn resolve(&self, deployment_id: &str) -> Arc<EnvMap> {
        if let Some(cached) = self.cache.get(deployment_id) {
            return cached.clone();
        }

        let key = metadata_key(deployment_id);
        let overrides = match self.store.get_bytes(&key).await {
            Ok(Some(bytes)) => match parse_overrides(&bytes) {
                Ok(overrides) => overrides,
                Err(e) => {
                    warn!(deployment_id = %deployment_id, error = %e, "Ignoring malformed deployment metadata");
                    return self.base.clone();
                }
            },
            Ok(None) => {
                debug!(deployment_id = %deployment_id, "No deployment metadata");
                EnvMap::new()
            }
            Err(e) => {
                warn!(deployment_id = %deployment_id, error = %e, "Failed to fetch deployment metadata");
                return self.base.clone();
            }
        };

        let merged = Arc::new(merge(&self.base, overrides));
        self.cache
            .insert(deployment_id.to_string(), merged.clone());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerun_core::object_store::MemoryObjectStore;

    fn base() -> EnvMap {
        HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("MODE".to_string(), "base".to_string()),
        ])
    }

    #[test]
    fn test_parse_overrides_aliases() {
        for doc in [
            r#"{"env": {"A": "1"}}"#,
            r#"{"environment": {"A": "1"}}"#,
            r#"{"envVars": {"A": "1"}}"#,
        ] {
            let overrides = parse_overrides(doc.as_bytes()).unwrap();
            assert_eq!(overrides.get("A").map(String::as_str), Some("1"));
        }
    }

    #[test]
    fn test_parse_overrides_stringifies_scalars() {
        let overrides =
            parse_overrides(br#"{"env": {"N": 3, "B": true, "S": "x", "Z": null}}"#).unwrap();
        assert_eq!(overrides["N"], "3");
        assert_eq!(overrides["B"], "true");
        assert_eq!(overrides["S"], "x");
        assert!(!overrides.contains_key("Z"));
    }

    #[test]
    fn test_merge_override_wins() {
        let merged = merge(
            &base(),
            HashMap::from([("MODE".to_string(), "deploy".to_string())]),
        );
        assert_eq!(merged["MODE"], "deploy");
        assert_eq!(merged["PATH"], "/usr/bin");
    }

    #[tokio::test]
    async fn test_resolve_merges_metadata() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert(
            "deployments/d1/metadata.json",
            r#"{"env": {"MODE": "deploy", "API": "x"}}"#,
        );
        let env = DeploymentEnv::new(base(), store.clone());

        let merged = env.resolve("d1").await;
        assert_eq!(merged["MODE"], "deploy");
        assert_eq!(merged["API"], "x");

        env.resolve("d1").await;
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_retain_drops_other_deployments() {
        let store = Arc::new(MemoryObjectStore::new());
        let env = DeploymentEnv::new(base(), store.clone());
        env.resolve("d1").await;
        env.clone().resolve("d2").await;

        assert_eq!(env.retain(|d| d == "d2"), 1);
        assert!(!env.is_cached("d1"));
        assert!(env.is_cached("d2"));

        env.resolve("d1").await;
        assert_eq!(store.fetch_count_for("deployments/d1/metadata.json"), 2);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_base() {
        let store = Arc::new(MemoryObjectStore::new());
        store.insert("deployments/bad/metadata.json", "not json");
        store.fail_key("deployments/down/metadata.json");
        let env = DeploymentEnv::new(base(), store);

        assert_eq!(*env.resolve("bad").await, base());
        assert_eq!(*env.resolve("down").await, base());
        assert_eq!(*env.resolve("none").await, base());
    }
}
