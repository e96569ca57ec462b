// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-lived worker processes.
//!
//! One process per identity, started in the worker directory on first use
//! with `PORT` set to a free loopback port. Requests are forwarded to it over
//! HTTP and its response is streamed back as is. A worker that exited is
//! respawned on the next request; one that exceeds the execution timeout is
//! killed.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING, UPGRADE};
use dashmap::DashMap;
use edgerun_core::object_store::ByteStream;
use futures::{StreamExt, TryStreamExt};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::command::WorkerCommand;
use super::traits::*;
use crate::identity::WorkerIdentity;
use crate::logs::{LogHub, LogStream};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

type WorkerSlot = Arc<Mutex<Option<ManagedWorker>>>;

struct ManagedWorker {
    child: Child,
    port: u16,
    entry: PathBuf,
}

impl ManagedWorker {
    /// SIGTERM, then SIGKILL after `grace`.
    async fn stop(mut self, identity: &WorkerIdentity, grace: Duration) {
        if let Some(pid) = self.child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(worker = %identity, pid, "Sent SIGTERM to worker"),
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(worker = %identity, pid, "Worker already gone (ESRCH)");
                }
                Err(e) => warn!(worker = %identity, pid, error = %e, "Failed to send SIGTERM"),
            }
        }

        if timeout(grace, self.child.wait()).await.is_err() {
            warn!(worker = %identity, "Worker ignored SIGTERM, killing");
            let _ = self.child.kill().await;
        }
        info!(worker = %identity, "Worker stopped");
    }

    async fn kill(mut self, identity: &WorkerIdentity) {
        if let Err(e) = self.child.kill().await {
            debug!(worker = %identity, error = %e, "Kill failed");
        }
        info!(worker = %identity, "Worker killed");
    }
}

/// Configuration for [`ProcessRunner`].
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// How to start a worker
    pub command: WorkerCommand,
    /// How long a fresh worker may take to accept connections
    pub startup_timeout: Duration,
    /// How long a worker gets between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            command: WorkerCommand::default(),
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// Runner keeping one worker process per identity.
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    client: reqwest::Client,
    logs: LogHub,
    workers: DashMap<WorkerIdentity, WorkerSlot>,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig, logs: LogHub) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .no_gzip()
            .build()
            .map_err(|e| RunnerError::Other(e.to_string()))?;
        Ok(Self {
            config,
            client,
            logs,
            workers: DashMap::new(),
        })
    }

    fn slot(&self, identity: &WorkerIdentity) -> WorkerSlot {
        self.workers
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Port of a live worker for `spec`, spawning one if needed.
    async fn ensure_worker(&self, slot: &WorkerSlot, spec: &WorkerSpec) -> Result<u16> {
        let mut current = slot.lock().await;

        if let Some(worker) = current.as_mut() {
            match worker.child.try_wait() {
                Ok(None) if worker.entry == spec.entry => return Ok(worker.port),
                Ok(None) => debug!(worker = %spec.identity, "Entry changed, restarting worker"),
                Ok(Some(status)) => {
                    warn!(worker = %spec.identity, status = %status, "Worker exited, respawning");
                }
                Err(e) => warn!(worker = %spec.identity, error = %e, "Cannot poll worker, respawning"),
            }
            if let Some(old) = current.take() {
                old.kill(&spec.identity).await;
            }
        }

        let worker = self.spawn(spec).await?;
        let port = worker.port;
        *current = Some(worker);
        Ok(port)
    }

    async fn spawn(&self, spec: &WorkerSpec) -> Result<ManagedWorker> {
        let port = free_port()?;
        let mut child = self
            .config
            .command
            .command(spec, Some(port))
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("{}: {}", self.config.command.program, e)))?;

        if let Some(stdout) = child.stdout.take() {
            self.logs.pump(&spec.identity, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.logs.pump(&spec.identity, LogStream::Stderr, stderr);
        }

        match timeout(self.config.startup_timeout, wait_ready(&mut child, port)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = child.kill().await;
                return Err(RunnerError::StartFailed(format!(
                    "worker not listening on port {} after {:?}",
                    port, self.config.startup_timeout
                )));
            }
        }

        info!(
            worker = %spec.identity,
            pid = child.id(),
            port,
            memory_mb = spec.memory_mb,
            "Worker started"
        );

        Ok(ManagedWorker {
            child,
            port,
            entry: spec.entry.clone(),
        })
    }

    async fn kill_slot(slot: &WorkerSlot, identity: &WorkerIdentity) {
        if let Some(worker) = slot.lock().await.take() {
            worker.kill(identity).await;
        }
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    Ok(listener.local_addr()?.port())
}

async fn wait_ready(child: &mut Child, port: u16) -> Result<()> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(RunnerError::StartFailed(format!(
                "worker exited during startup: {}",
                status
            )));
        }
        if tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .is_ok()
        {
            return Ok(());
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE] {
        forwarded.remove(name);
    }
    forwarded.remove("keep-alive");
    forwarded
}

/// Wrap a worker body so it fails, and the worker is killed, once `deadline`
/// passes.
fn body_with_deadline(
    mut body: ByteStream,
    deadline: Instant,
    slot: WorkerSlot,
    identity: WorkerIdentity,
) -> ByteStream {
    async_stream::try_stream! {
        loop {
            match timeout_at(deadline, body.next()).await {
                Ok(Some(chunk)) => yield chunk?,
                Ok(None) => break,
                Err(_) => {
                    warn!(worker = %identity, "Response exceeded execution timeout");
                    ProcessRunner::kill_slot(&slot, &identity).await;
                    Err::<(), _>(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "execution timeout",
                    ))?;
                }
            }
        }
    }
    .boxed()
}

#[async_trait]
impl WorkerRunner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, spec: &WorkerSpec, request: WorkerRequest) -> Result<WorkerResponse> {
        let deadline = Instant::now() + spec.timeout;
        let slot = self.slot(&spec.identity);

        let port = match timeout_at(deadline, self.ensure_worker(&slot, spec)).await {
            Ok(port) => port?,
            Err(_) => {
                Self::kill_slot(&slot, &spec.identity).await;
                return Err(RunnerError::Timeout);
            }
        };

        let url = format!("http://127.0.0.1:{}{}", port, request.path_and_query);
        let send = self
            .client
            .request(request.method, url)
            .headers(forwardable_headers(&request.headers))
            .body(request.body)
            .send();

        let response = match timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(worker = %spec.identity, error = %e, "Worker request failed");
                Self::kill_slot(&slot, &spec.identity).await;
                return Err(RunnerError::Protocol(e.to_string()));
            }
            Err(_) => {
                warn!(worker = %spec.identity, "Worker exceeded execution timeout");
                Self::kill_slot(&slot, &spec.identity).await;
                return Err(RunnerError::Timeout);
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(WorkerResponse {
            status,
            headers,
            body: body_with_deadline(body, deadline, slot, spec.identity.clone()),
        })
    }

    async fn release(&self, identity: &WorkerIdentity) -> Result<()> {
        if let Some((_, slot)) = self.workers.remove(identity)
            && let Some(worker) = slot.lock().await.take()
        {
            worker.stop(identity, self.config.stop_grace).await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        let identities: Vec<WorkerIdentity> =
            self.workers.iter().map(|e| e.key().clone()).collect();
        info!(count = identities.len(), "Stopping workers");
        for identity in identities {
            let _ = self.release(&identity).await;
        }
    }

    fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|e| e.value().try_lock().map(|w| w.is_some()).unwrap_or(true))
            .count()
    }
}
