// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for edgerun-gateway.

use std::net::SocketAddr;
use std::time::Duration;

use edgerun_core::ObjectStoreError;
use edgerun_core::object_store::ObjectStoreConfig;

use crate::resolver::HostRewrite;

/// Default cap on buffered request bodies forwarded to functions.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Base URL of the control-plane domain lookup API
    pub control_plane_url: String,
    /// Base URL of the function execution service
    pub executor_url: String,
    /// Hard ceiling on one streamed function response
    pub stream_timeout: Duration,
    /// How long a domain binding may be served from cache (zero disables caching)
    pub binding_cache_ttl: Duration,
    /// Host suffix substitution applied before lookup
    pub host_rewrite: Option<HostRewrite>,
    /// Largest request body forwarded to a function
    pub max_request_body_bytes: usize,
    /// Where deployment bundles are read from
    pub object_store: ObjectStoreConfig,
}

fn env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let control_plane_url = std::env::var("EDGERUN_CONTROL_PLANE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("EDGERUN_CONTROL_PLANE_URL"))?;

        let port: u16 = std::env::var("EDGERUN_GATEWAY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let executor_url = std::env::var("EDGERUN_EXECUTOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8090".to_string());

        let stream_timeout = Duration::from_secs(env_or("EDGERUN_STREAM_TIMEOUT_SECS", 60)?);
        let binding_cache_ttl =
            Duration::from_secs(env_or("EDGERUN_BINDING_CACHE_TTL_SECS", 30)?);
        let max_request_body_bytes = env_or(
            "EDGERUN_MAX_REQUEST_BODY_BYTES",
            DEFAULT_MAX_REQUEST_BODY_BYTES,
        )?;

        let host_rewrite = match std::env::var("EDGERUN_HOST_REWRITE") {
            Ok(raw) if !raw.trim().is_empty() => {
                Some(HostRewrite::parse(&raw).ok_or(ConfigError::InvalidValue {
                    name: "EDGERUN_HOST_REWRITE",
                    value: raw,
                })?)
            }
            _ => None,
        };

        let object_store = ObjectStoreConfig::from_env()?;

        Ok(Self {
            bind_addr,
            control_plane_url,
            executor_url,
            stream_timeout,
            binding_cache_ttl,
            host_rewrite,
            max_request_body_bytes,
            object_store,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
    /// Object store settings are missing or conflicting.
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
}
