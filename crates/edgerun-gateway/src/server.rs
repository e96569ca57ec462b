// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound HTTP surface of the gateway.
//!
//! Every request except the reserved `/_edgerun/` prefix goes through
//! resolve → match → (static | proxy). Only `GET` and `HEAD` fall through to
//! static assets; any other unmatched method is a 404.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::{Method, Response};
use axum::response::IntoResponse;
use axum::routing::get;
use edgerun_core::Resource;
use edgerun_core::routing::{match_route, normalize_path};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::proxy::FunctionProxy;
use crate::resolver::ManifestResolver;
use crate::static_assets::{AssetRequest, StaticAssetServer};

/// Shared state of the gateway's request handlers.
pub struct GatewayState {
    pub resolver: ManifestResolver,
    pub assets: StaticAssetServer,
    pub proxy: FunctionProxy,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(resolver: ManifestResolver, assets: StaticAssetServer, proxy: FunctionProxy) -> Self {
        Self {
            resolver,
            assets,
            proxy,
            started_at: Instant::now(),
        }
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/_edgerun/health", get(health))
        .fallback(dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
    }))
}

async fn dispatch(State(state): State<Arc<GatewayState>>, request: Request) -> Response<Body> {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// The inbound host: `Host` header, or the authority of an absolute URI.
fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.trim().is_empty())
}

async fn handle(state: &GatewayState, request: Request) -> Result<Response<Body>> {
    let host = request_host(&request).ok_or(GatewayError::MissingHost)?;
    let deployment = state.resolver.resolve(&host).await?;

    let path = request.uri().path().to_string();
    let method = request.method().clone();

    let dynamic = match match_route(&deployment.manifest, &path, method.as_str()) {
        Some(Resource::Dynamic(entry)) => Some(entry.clone()),
        _ => None,
    };

    if let Some(entry) = dynamic {
        return state.proxy.forward(&deployment, &entry, request).await;
    }

    // Only GET and HEAD walk the static fallback chain
    if method != Method::GET && method != Method::HEAD {
        debug!(
            deployment_id = %deployment.deployment_id,
            method = %method,
            path = %path,
            "No function accepts this method"
        );
        return Err(GatewayError::RouteNotFound {
            path: normalize_path(&path),
            resources: deployment.manifest.len(),
        });
    }

    debug!(
        deployment_id = %deployment.deployment_id,
        path = %path,
        "No function matched, trying static assets"
    );

    state
        .assets
        .serve(AssetRequest {
            manifest: &deployment.manifest,
            deployment_id: &deployment.deployment_id,
            path: &path,
            headers: request.headers(),
            head_only: method == Method::HEAD,
        })
        .await
}
