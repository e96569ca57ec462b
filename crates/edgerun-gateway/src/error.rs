// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for edgerun-gateway.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use edgerun_core::ManifestError;
use serde_json::json;
use thiserror::Error;

/// Gateway errors. Every variant is request-local; none are retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The request carried no usable `Host`.
    #[error("Missing Host header")]
    MissingHost,

    /// No domain binding exists for the host.
    #[error("No deployment bound to host {host}")]
    BindingNotFound {
        /// Normalized host that was looked up.
        host: String,
    },

    /// The binding exists but carries no manifest.
    #[error("Deployment bound to host {host} has no manifest")]
    ManifestMissing {
        /// Normalized host that was looked up.
        host: String,
    },

    /// The control plane returned a manifest that failed validation.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    /// The control plane could not be reached or answered with an error.
    #[error("Control plane lookup failed: {0}")]
    ControlPlane(String),

    /// Nothing in the manifest serves this path.
    #[error("Not found: {path}")]
    RouteNotFound {
        /// Request path after normalization.
        path: String,
        /// Number of resources in the manifest.
        resources: usize,
    },

    /// The function execution service failed before streaming started.
    #[error("Function execution failed: {0}")]
    Upstream(String),

    /// The function execution service sent no response headers before the
    /// streaming deadline.
    #[error("Function execution service did not respond within {timeout_ms} ms")]
    UpstreamTimeout {
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The buffered request body exceeded the configured limit.
    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Anything else that prevents building a response.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status this error is surfaced as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHost => StatusCode::BAD_REQUEST,
            Self::BindingNotFound { .. } | Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ControlPlane(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ManifestMissing { .. }
            | Self::InvalidManifest(_)
            | Self::Upstream(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::RouteNotFound { path, resources } => json!({
                "error": "Not found",
                "path": path,
                "resources": resources,
            }),
            Self::BindingNotFound { host } | Self::ManifestMissing { host } => json!({
                "error": self.to_string(),
                "host": host,
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::MissingHost.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::BindingNotFound { host: "a".into() }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ManifestMissing { host: "a".into() }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::ControlPlane("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout { timeout_ms: 10 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::BodyTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_route_not_found_body_is_diagnostic() {
        let response = GatewayError::RouteNotFound {
            path: "/missing".into(),
            resources: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["path"], "/missing");
        assert_eq!(json["resources"], 3);
    }
}
