// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for edgerun-gateway.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use edgerun_core::object_store::FsObjectStore;
//! use edgerun_gateway::resolver::HttpBindingSource;
//! use edgerun_gateway::runtime::GatewayRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = reqwest::Client::new();
//!     let bindings = HttpBindingSource::new(client.clone(), "http://control-plane:9000")?;
//!
//!     let runtime = GatewayRuntime::builder()
//!         .client(client)
//!         .binding_source(Arc::new(bindings))
//!         .object_store(Arc::new(FsObjectStore::new("/srv/bundles")))
//!         .executor_url("http://127.0.0.1:8090")
//!         .bind_addr("0.0.0.0:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use edgerun_core::ObjectStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DEFAULT_MAX_REQUEST_BODY_BYTES;
use crate::proxy::FunctionProxy;
use crate::resolver::{BindingSource, HostRewrite, ManifestResolver};
use crate::server::{GatewayState, router};
use crate::static_assets::StaticAssetServer;

/// Builder for creating a [`GatewayRuntime`].
pub struct GatewayRuntimeBuilder {
    binding_source: Option<Arc<dyn BindingSource>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    client: Option<reqwest::Client>,
    bind_addr: SocketAddr,
    executor_url: String,
    stream_timeout: Duration,
    binding_cache_ttl: Duration,
    host_rewrite: Option<HostRewrite>,
    max_request_body_bytes: usize,
}

impl Default for GatewayRuntimeBuilder {
    fn default() -> Self {
        Self {
            binding_source: None,
            object_store: None,
            client: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            executor_url: "http://127.0.0.1:8090".to_string(),
            stream_timeout: Duration::from_secs(60),
            binding_cache_ttl: Duration::from_secs(30),
            host_rewrite: None,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }
}

impl GatewayRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the control-plane binding source (required).
    pub fn binding_source(mut self, source: Arc<dyn BindingSource>) -> Self {
        self.binding_source = Some(source);
        self
    }

    /// Set the object store holding deployment bundles (required).
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Set the HTTP client used to reach the executor.
    ///
    /// Default: a fresh `reqwest::Client`
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the listen address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the function execution service base URL.
    ///
    /// Default: `http://127.0.0.1:8090`
    pub fn executor_url(mut self, url: impl Into<String>) -> Self {
        self.executor_url = url.into();
        self
    }

    /// Set the ceiling on one streamed function response.
    ///
    /// Default: 60 seconds
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    /// Set how long bindings are cached. Zero disables the cache.
    ///
    /// Default: 30 seconds
    pub fn binding_cache_ttl(mut self, ttl: Duration) -> Self {
        self.binding_cache_ttl = ttl;
        self
    }

    /// Set the host suffix rewrite applied before lookup.
    pub fn host_rewrite(mut self, rewrite: Option<HostRewrite>) -> Self {
        self.host_rewrite = rewrite;
        self
    }

    /// Set the cap on buffered request bodies.
    ///
    /// Default: 10 MiB
    pub fn max_request_body_bytes(mut self, limit: usize) -> Self {
        self.max_request_body_bytes = limit;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<GatewayRuntimeConfig> {
        let binding_source = self
            .binding_source
            .ok_or_else(|| anyhow::anyhow!("binding_source is required"))?;
        let object_store = self
            .object_store
            .ok_or_else(|| anyhow::anyhow!("object_store is required"))?;

        let resolver = ManifestResolver::new(binding_source)
            .with_cache_ttl(self.binding_cache_ttl)
            .with_rewrite(self.host_rewrite);
        let proxy = FunctionProxy::new(
            self.client.unwrap_or_default(),
            self.executor_url,
            self.stream_timeout,
            self.max_request_body_bytes,
        );

        Ok(GatewayRuntimeConfig {
            state: Arc::new(GatewayState::new(
                resolver,
                StaticAssetServer::new(object_store),
                proxy,
            )),
            bind_addr: self.bind_addr,
        })
    }
}

/// Configuration for a [`GatewayRuntime`].
pub struct GatewayRuntimeConfig {
    state: Arc<GatewayState>,
    bind_addr: SocketAddr,
}

impl GatewayRuntimeConfig {
    /// Bind the listener and start serving.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = router(self.state.clone());

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while server_shutdown_rx.changed().await.is_ok() {
                        if *server_shutdown_rx.borrow() {
                            break;
                        }
                    }
                })
                .await?;
            Ok::<(), anyhow::Error>(())
        });

        info!(bind_addr = %local_addr, "GatewayRuntime started");

        Ok(GatewayRuntime {
            server_handle,
            server_shutdown_tx,
            state: self.state,
            local_addr,
        })
    }
}

/// A running gateway.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GatewayRuntime {
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    state: Arc<GatewayState>,
    local_addr: SocketAddr,
}

impl GatewayRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Check if the server task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("GatewayRuntime shutting down...");
        let _ = self.server_shutdown_tx.send(true);

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("GatewayRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Gateway server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Gateway server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
