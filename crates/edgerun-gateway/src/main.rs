// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edgerun Gateway - inbound tenant traffic
//!
//! An HTTP server responsible for:
//! - Resolving the `Host` of each request to a deployment
//! - Serving static assets from the object store
//! - Proxying function requests to the execution service

use std::sync::Arc;
use tracing::{info, warn};

use edgerun_gateway::config::Config;
use edgerun_gateway::resolver::HttpBindingSource;
use edgerun_gateway::runtime::GatewayRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "edgerun_gateway=info,tower_http=info".into());
    if std::env::var("EDGERUN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        control_plane = %config.control_plane_url,
        executor = %config.executor_url,
        cache_ttl_secs = config.binding_cache_ttl.as_secs(),
        "Starting Edgerun Gateway"
    );

    // One client, shared by the control plane lookup, object store and proxy
    let client = reqwest::Client::builder().build()?;

    let object_store = config.object_store.build(client.clone())?;
    info!(backend = object_store.backend_type(), "Object store initialized");

    let bindings = HttpBindingSource::new(client.clone(), &config.control_plane_url)?;

    let runtime = GatewayRuntime::builder()
        .client(client)
        .binding_source(Arc::new(bindings))
        .object_store(object_store)
        .executor_url(&config.executor_url)
        .bind_addr(config.bind_addr)
        .stream_timeout(config.stream_timeout)
        .binding_cache_ttl(config.binding_cache_ttl)
        .host_rewrite(config.host_rewrite.clone())
        .max_request_body_bytes(config.max_request_body_bytes)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Gateway ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Edgerun Gateway shut down");

    Ok(())
}
