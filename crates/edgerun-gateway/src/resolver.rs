// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host to deployment resolution.
//!
//! The control plane owns domain bindings; this module only reads them. A
//! lookup is a single call per request, with no retries. An optional
//! time-bounded cache sits in front of the lookup: a redeploy becomes visible
//! at most one TTL after the control plane switches the binding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use edgerun_core::Manifest;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// A domain binding as returned by the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainBinding {
    pub deployment_id: String,
    pub project_id: String,
    /// `None` when the deployment exists but has not published a manifest.
    pub manifest: Option<Manifest>,
}

/// Deployment selected for a request.
#[derive(Debug, Clone)]
pub struct ResolvedDeployment {
    pub manifest: Arc<Manifest>,
    pub deployment_id: String,
    pub project_id: String,
}

/// Control-plane lookup of domain bindings.
#[async_trait]
pub trait BindingSource: Send + Sync {
    /// Source identifier (e.g. "http", "static").
    fn source_type(&self) -> &'static str;

    /// Look up the binding for a normalized hostname. `Ok(None)` means unbound.
    async fn lookup(&self, hostname: &str) -> Result<Option<DomainBinding>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingRecord {
    deployment_id: String,
    project_id: String,
    #[serde(default)]
    manifest: Option<serde_json::Value>,
}

/// Binding source backed by the control plane's `GET /v1/domains/{hostname}`.
#[derive(Debug, Clone)]
pub struct HttpBindingSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBindingSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| {
            GatewayError::ControlPlane(format!("invalid control plane URL {base_url}: {e}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::ControlPlane(format!(
                "control plane URL {base_url} cannot carry a path"
            )));
        }
        Ok(Self { client, base_url })
    }

    fn lookup_url(&self, hostname: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::ControlPlane("control plane URL has no path".to_string()))?
            .pop_if_empty()
            .extend(["v1", "domains", hostname]);
        Ok(url)
    }
}

#[async_trait]
impl BindingSource for HttpBindingSource {
    fn source_type(&self) -> &'static str {
        "http"
    }

    async fn lookup(&self, hostname: &str) -> Result<Option<DomainBinding>> {
        let url = self.lookup_url(hostname)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::ControlPlane(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => {
                return Err(GatewayError::ControlPlane(format!(
                    "lookup of {hostname} returned {status}"
                )));
            }
            _ => {}
        }

        let record: BindingRecord = response
            .json()
            .await
            .map_err(|e| GatewayError::ControlPlane(format!("invalid binding: {e}")))?;

        let manifest = match record.manifest {
            Some(serde_json::Value::Null) | None => None,
            Some(value) => Some(Manifest::from_value(value)?),
        };

        Ok(Some(DomainBinding {
            deployment_id: record.deployment_id,
            project_id: record.project_id,
            manifest,
        }))
    }
}

/// In-memory binding source for tests and single-tenant setups.
#[derive(Debug, Default)]
pub struct StaticBindingSource {
    bindings: DashMap<String, DomainBinding>,
    lookups: AtomicUsize,
}

impl StaticBindingSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a map of hostname to binding.
    pub fn from_map(bindings: HashMap<String, DomainBinding>) -> Self {
        let source = Self::new();
        for (host, binding) in bindings {
            source.insert(host, binding);
        }
        source
    }

    /// Bind `hostname` (case-insensitive) to a deployment.
    pub fn insert(&self, hostname: impl Into<String>, binding: DomainBinding) {
        self.bindings
            .insert(hostname.into().to_ascii_lowercase(), binding);
    }

    /// Drop the binding of `hostname`.
    pub fn remove(&self, hostname: &str) {
        self.bindings.remove(&hostname.to_ascii_lowercase());
    }

    /// Number of lookups served, including misses.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BindingSource for StaticBindingSource {
    fn source_type(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, hostname: &str) -> Result<Option<DomainBinding>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.bindings.get(hostname).map(|b| b.value().clone()))
    }
}

/// Host suffix substitution for the platform's default wildcard domain.
///
/// `from=to` rewrites `app.from` to `app.to` before lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRewrite {
    from_suffix: String,
    to_suffix: String,
}

impl HostRewrite {
    pub fn new(from_suffix: impl Into<String>, to_suffix: impl Into<String>) -> Self {
        Self {
            from_suffix: from_suffix.into().to_ascii_lowercase(),
            to_suffix: to_suffix.into().to_ascii_lowercase(),
        }
    }

    /// Parse `from=to`. Both sides must be non-empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let (from, to) = raw.split_once('=')?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return None;
        }
        Some(Self::new(from, to))
    }

    /// Apply the rewrite if `host` ends with the source suffix.
    pub fn apply(&self, host: &str) -> String {
        match host.strip_suffix(&self.from_suffix) {
            Some(prefix) => format!("{}{}", prefix, self.to_suffix),
            None => host.to_string(),
        }
    }
}

/// Strip a trailing `:port` from a `Host` value. IPv6 literals lose their
/// brackets.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

/// Normalize a raw `Host` header value for lookup.
pub fn normalize_host(raw: &str) -> String {
    strip_port(raw.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

struct CachedBinding {
    resolved: ResolvedDeployment,
    fetched_at: Instant,
}

/// Resolves inbound hosts to deployments.
pub struct ManifestResolver {
    source: Arc<dyn BindingSource>,
    rewrite: Option<HostRewrite>,
    cache_ttl: Duration,
    cache: DashMap<String, CachedBinding>,
}

impl ManifestResolver {
    /// Create a resolver without caching or rewriting.
    pub fn new(source: Arc<dyn BindingSource>) -> Self {
        Self {
            source,
            rewrite: None,
            cache_ttl: Duration::ZERO,
            cache: DashMap::new(),
        }
    }

    /// Serve bindings from memory for up to `ttl`. Zero disables the cache.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Rewrite hosts before lookup.
    pub fn with_rewrite(mut self, rewrite: Option<HostRewrite>) -> Self {
        self.rewrite = rewrite;
        self
    }

    /// Drop every cached binding.
    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    /// Number of bindings currently held in the cache, expired or not.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a raw `Host` header value.
    pub async fn resolve(&self, raw_host: &str) -> Result<ResolvedDeployment> {
        let mut host = normalize_host(raw_host);
        if host.is_empty() {
            return Err(GatewayError::MissingHost);
        }
        if let Some(rewrite) = &self.rewrite {
            host = rewrite.apply(&host);
        }

        if !self.cache_ttl.is_zero()
            && let Some(cached) = self.cache.get(&host)
        {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                debug!(host = %host, "Binding served from cache");
                return Ok(cached.resolved.clone());
            }
            drop(cached);
            self.cache.remove(&host);
        }

        let binding = self.source.lookup(&host).await.inspect_err(|e| {
            warn!(host = %host, source = self.source.source_type(), error = %e, "Binding lookup failed");
        })?;

        let Some(binding) = binding else {
            return Err(GatewayError::BindingNotFound { host });
        };
        let Some(manifest) = binding.manifest else {
            return Err(GatewayError::ManifestMissing { host });
        };

        let resolved = ResolvedDeployment {
            manifest: Arc::new(manifest),
            deployment_id: binding.deployment_id,
            project_id: binding.project_id,
        };

        if !self.cache_ttl.is_zero() {
            // Expired entries of other hosts go too
            let ttl = self.cache_ttl;
            self.cache.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
            self.cache.insert(
                host,
                CachedBinding {
                    resolved: resolved.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(resolved)
    }
}
