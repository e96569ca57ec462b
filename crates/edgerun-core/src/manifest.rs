// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment manifests.
//!
//! A manifest is produced once when a deployment is built and never changes
//! afterwards. It lists every routable resource of the deployment:
//!
//! ```json
//! {
//!   "version": 1,
//!   "resources": [
//!     { "kind": "static",  "urlPath": "/index.html", "resourcePath": "app/index.html" },
//!     { "kind": "dynamic", "urlPath": "/api/users/:id", "resourcePath": "api/users.js", "methods": ["GET"] }
//!   ]
//! }
//! ```
//!
//! Manifests are validated once at parse time ([`Manifest::from_json`]); the
//! route matcher assumes every entry it sees is well formed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// An immutable list of resources belonging to one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest schema version.
    #[serde(default)]
    pub version: u64,
    /// Routable resources, in the order the build emitted them.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// One routable entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    /// A file served as-is from the object store.
    Static(StaticResource),
    /// A function executed by the executor.
    Dynamic(DynamicResource),
}

/// A static file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticResource {
    /// Public path, matched exactly after normalization.
    pub url_path: String,
    /// Object path relative to the deployment prefix.
    pub resource_path: String,
    /// Response headers declared by the build (e.g. `cache-control`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// A dynamically executed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicResource {
    /// Route pattern: literal segments, `:param` segments, and `*`.
    pub url_path: String,
    /// Function source path relative to the deployment prefix.
    pub resource_path: String,
    /// Accepted methods (upper case). `None` accepts any method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    /// Catch-all route: the pattern also matches everything below it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

impl Resource {
    /// Public path or route pattern.
    pub fn url_path(&self) -> &str {
        match self {
            Resource::Static(r) => &r.url_path,
            Resource::Dynamic(r) => &r.url_path,
        }
    }

    /// Object path relative to the deployment prefix.
    pub fn resource_path(&self) -> &str {
        match self {
            Resource::Static(r) => &r.resource_path,
            Resource::Dynamic(r) => &r.resource_path,
        }
    }

    /// Whether this entry is a static file.
    pub fn is_static(&self) -> bool {
        matches!(self, Resource::Static(_))
    }

    /// Whether this entry is a function.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Resource::Dynamic(_))
    }
}

impl DynamicResource {
    /// Whether `method` is accepted by this function (case-insensitive).
    pub fn accepts_method(&self, method: &str) -> bool {
        match &self.methods {
            None => true,
            Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
        }
    }

    /// The pattern used for matching and scoring.
    ///
    /// A `wildcard` entry whose pattern does not already end in `*` gets an
    /// implicit trailing `*` segment.
    pub fn effective_pattern(&self) -> String {
        let ends_with_star = self
            .url_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .is_some_and(|seg| seg == "*");

        if self.wildcard.unwrap_or(false) && !ends_with_star {
            format!("{}/*", self.url_path.trim_end_matches('/'))
        } else {
            self.url_path.clone()
        }
    }
}

impl Manifest {
    /// Parse and validate a manifest from its JSON text.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validated()
    }

    /// Parse and validate a manifest from an already decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_value(value)?;
        manifest.validated()
    }

    /// Number of resources in the manifest.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the manifest has no resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Iterate over the static entries.
    pub fn static_resources(&self) -> impl Iterator<Item = &StaticResource> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Static(s) => Some(s),
            Resource::Dynamic(_) => None,
        })
    }

    /// Iterate over the dynamic entries.
    pub fn dynamic_resources(&self) -> impl Iterator<Item = &DynamicResource> {
        self.resources.iter().filter_map(|r| match r {
            Resource::Dynamic(d) => Some(d),
            Resource::Static(_) => None,
        })
    }

    fn validated(mut self) -> Result<Self, ManifestError> {
        for (index, resource) in self.resources.iter_mut().enumerate() {
            let invalid = |reason: &str| ManifestError::InvalidResource {
                index,
                reason: reason.to_string(),
            };

            if resource.url_path().trim().is_empty() {
                return Err(invalid("urlPath is empty"));
            }
            if resource.resource_path().trim().is_empty() {
                return Err(invalid("resourcePath is empty"));
            }
            if resource.resource_path().split('/').any(|seg| seg == "..") {
                return Err(invalid("resourcePath must not contain '..'"));
            }

            if let Resource::Dynamic(dynamic) = resource
                && let Some(methods) = dynamic.methods.as_mut()
            {
                if methods.iter().any(|m| m.trim().is_empty()) {
                    return Err(invalid("methods must not contain empty entries"));
                }
                for method in methods.iter_mut() {
                    *method = method.trim().to_ascii_uppercase();
                }
            }
        }

        Ok(self)
    }
}
