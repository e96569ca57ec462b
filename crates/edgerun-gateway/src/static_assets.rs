// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static asset delivery.
//!
//! A request that no function claims walks a fallback chain of manifest
//! lookups; the first static entry whose object can be fetched is streamed
//! to the client:
//!
//! 1. the exact normalized path
//! 2. the path's `index.html` (served as `text/html`)
//! 3. the root `/index.html` (served as `text/html`)
//!
//! Store failures for a bound entry fall through to the next step. When the
//! chain is exhausted the client gets a 404 with a diagnostic JSON body.

use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED, VARY,
};
use axum::http::{Response, StatusCode};
use bytes::Bytes;
use edgerun_core::Manifest;
use edgerun_core::manifest::StaticResource;
use edgerun_core::object_store::{ByteStream, ObjectStore, StoredObject, deployment_key};
use edgerun_core::routing::{find_static, normalize_path};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Cache policy applied when a resource does not declare its own.
pub const DEFAULT_CACHE_CONTROL: &str = "public, max-age=3600";

const TEXT_HTML: &str = "text/html";
const OCTET_STREAM: &str = "application/octet-stream";

/// One step of the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    path: String,
    content_type: Option<&'static str>,
}

fn fallback_chain(path: &str) -> Vec<Candidate> {
    let path = normalize_path(path);
    let index = if path.ends_with('/') {
        format!("{path}index.html")
    } else {
        format!("{path}/index.html")
    };

    let mut chain = vec![
        Candidate {
            path,
            content_type: None,
        },
        Candidate {
            path: index,
            content_type: Some(TEXT_HTML),
        },
        Candidate {
            path: "/index.html".to_string(),
            content_type: Some(TEXT_HTML),
        },
    ];
    chain.dedup_by(|b, a| a.path == b.path);
    chain
}

/// Whether the client accepts gzip.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| {
            let mut parts = token.split(';');
            let coding = parts.next().unwrap_or_default().trim();
            let disabled = parts.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            coding.eq_ignore_ascii_case("gzip") && !disabled
        })
}

/// Whether a content type benefits from compression.
fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence == "application/javascript"
        || essence == "application/json"
}

fn declared_header<'a>(entry: &'a StaticResource, name: &str) -> Option<&'a str> {
    entry
        .headers
        .as_ref()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Content type: declared header, then the fallback override, then the file
/// extension, then whatever the store recorded.
fn content_type_for(
    entry: &StaticResource,
    override_type: Option<&'static str>,
    stored: Option<&str>,
) -> String {
    if let Some(declared) = declared_header(entry, CONTENT_TYPE.as_str()) {
        return declared.to_string();
    }
    if let Some(forced) = override_type {
        return forced.to_string();
    }
    if let Some(guessed) = mime_guess::from_path(&entry.resource_path).first_raw() {
        return guessed.to_string();
    }
    stored.unwrap_or(OCTET_STREAM).to_string()
}

/// Compress a byte stream chunk by chunk.
fn gzip_stream(mut body: ByteStream) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    async_stream::try_stream! {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            encoder.write_all(&chunk)?;
            let compressed = std::mem::take(encoder.get_mut());
            if !compressed.is_empty() {
                yield Bytes::from(compressed);
            }
        }
        let tail = encoder.finish()?;
        if !tail.is_empty() {
            yield Bytes::from(tail);
        }
    }
}

/// A static asset request after routing.
#[derive(Debug, Clone, Copy)]
pub struct AssetRequest<'a> {
    pub manifest: &'a Manifest,
    pub deployment_id: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    /// `HEAD` requests get headers only.
    pub head_only: bool,
}

/// Streams static resources out of the object store.
#[derive(Clone)]
pub struct StaticAssetServer {
    store: Arc<dyn ObjectStore>,
}

impl StaticAssetServer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Serve a request through the fallback chain.
    pub async fn serve(&self, request: AssetRequest<'_>) -> Result<Response<Body>> {
        for candidate in fallback_chain(request.path) {
            let Some(entry) = find_static(request.manifest, &candidate.path) else {
                continue;
            };

            let key = deployment_key(request.deployment_id, &entry.resource_path);
            match self.store.get(&key).await {
                Ok(Some(object)) => {
                    debug!(
                        deployment_id = %request.deployment_id,
                        path = %candidate.path,
                        key = %key,
                        "Serving static asset"
                    );
                    return build_response(&request, entry, candidate.content_type, object);
                }
                Ok(None) => {
                    warn!(
                        deployment_id = %request.deployment_id,
                        key = %key,
                        "Static resource bound but object missing"
                    );
                }
                Err(e) => {
                    warn!(
                        deployment_id = %request.deployment_id,
                        key = %key,
                        error = %e,
                        "Static asset fetch failed"
                    );
                }
            }
        }

        Err(GatewayError::RouteNotFound {
            path: normalize_path(request.path),
            resources: request.manifest.len(),
        })
    }
}

fn build_response(
    request: &AssetRequest<'_>,
    entry: &StaticResource,
    override_type: Option<&'static str>,
    object: StoredObject,
) -> Result<Response<Body>> {
    let content_type = content_type_for(entry, override_type, object.content_type.as_deref());
    let mut headers = HeaderMap::new();

    if let Some(declared) = &entry.headers {
        for (name, value) in declared {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid declared header"),
            }
        }
    }

    headers.insert(CONTENT_TYPE, header_value(&content_type)?);
    if let Some(etag) = object.etag.as_deref() {
        headers.insert(ETAG, header_value(etag)?);
    }
    if let Some(last_modified) = object.last_modified.as_deref() {
        headers.insert(LAST_MODIFIED, header_value(last_modified)?);
    }
    if !headers.contains_key(CACHE_CONTROL) {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(DEFAULT_CACHE_CONTROL));
    }

    let gzip = accepts_gzip(request.headers) && is_compressible(&content_type);
    let body = if gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(VARY, HeaderValue::from_static("accept-encoding"));
        headers.remove(CONTENT_LENGTH);
        if request.head_only {
            Body::empty()
        } else {
            Body::from_stream(gzip_stream(object.body))
        }
    } else {
        if let Some(len) = object.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        if request.head_only {
            Body::empty()
        } else {
            Body::from_stream(object.body)
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    Ok(response)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|e| GatewayError::Internal(format!("invalid header value {value:?}: {e}")))
}
