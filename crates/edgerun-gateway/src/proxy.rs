// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function proxy.
//!
//! Forwards a request matched to a dynamic resource to the function execution
//! service and bridges the response back to the client.
//!
//! Streamed responses go through a [`StreamingSession`]: a task that copies
//! upstream chunks into a bounded channel backing the client body. The
//! session ends on the first of:
//!
//! - upstream end of stream
//! - upstream read error
//! - client disconnect (the body, and with it the receiver, is dropped)
//! - the wall-clock deadline
//!
//! A full channel suspends the upstream read, so a slow client slows the
//! upstream instead of growing memory. The session owns the upstream stream,
//! so every exit path closes it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue,
    TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{Method, Response, StatusCode};
use bytes::Bytes;
use edgerun_core::headers::{
    X_ACCEL_BUFFERING, X_DEPLOYMENT_ID, X_FORWARDED_HOST, X_FUNCTION_PATH, X_PROJECT_ID,
};
use edgerun_core::manifest::DynamicResource;
use edgerun_core::object_store::{ByteStream, deployment_key};
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::resolver::ResolvedDeployment;

/// Chunks buffered between the upstream reader and the client.
pub const SESSION_CHANNEL_CAPACITY: usize = 8;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Request headers never forwarded upstream.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == HOST
        || name == CONNECTION
        || name == CONTENT_LENGTH
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name == KEEP_ALIVE
}

/// How a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Upstream finished and every byte was handed to the client.
    Completed { bytes: u64 },
    /// The client went away; upstream reads stopped.
    ClientDisconnected { bytes: u64 },
    /// The deadline fired; the client connection was aborted.
    TimedOut { bytes: u64 },
    /// Reading from upstream failed; the client connection was aborted.
    UpstreamError { bytes: u64, message: String },
}

/// Per-request bridge between an upstream body and the client.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    deployment_id: String,
    path: String,
    deadline: Duration,
}

impl StreamingSession {
    pub fn new(deployment_id: impl Into<String>, path: impl Into<String>, deadline: Duration) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            path: path.into(),
            deadline,
        }
    }

    /// Start copying `upstream` and return the client body plus the session
    /// task, which resolves to the outcome.
    pub fn start(self, mut upstream: ByteStream) -> (Body, JoinHandle<SessionOutcome>) {
        let (tx, rx) = mpsc::channel::<Bytes>(SESSION_CHANNEL_CAPACITY);
        let aborted = Arc::new(AtomicBool::new(false));
        let abort_flag = aborted.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let deadline = tokio::time::sleep(self.deadline);
            tokio::pin!(deadline);
            let mut bytes = 0u64;

            let outcome = loop {
                let next = tokio::select! {
                    biased;
                    _ = tx.closed() => break SessionOutcome::ClientDisconnected { bytes },
                    _ = &mut deadline => break SessionOutcome::TimedOut { bytes },
                    next = upstream.next() => next,
                };

                let chunk = match next {
                    None => break SessionOutcome::Completed { bytes },
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        break SessionOutcome::UpstreamError {
                            bytes,
                            message: e.to_string(),
                        };
                    }
                };

                let len = chunk.len() as u64;
                tokio::select! {
                    biased;
                    _ = &mut deadline => break SessionOutcome::TimedOut { bytes },
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            break SessionOutcome::ClientDisconnected { bytes };
                        }
                    }
                }
                bytes += len;
            };

            if matches!(
                outcome,
                SessionOutcome::TimedOut { .. } | SessionOutcome::UpstreamError { .. }
            ) {
                abort_flag.store(true, Ordering::SeqCst);
            }
            drop(tx);

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                SessionOutcome::Completed { bytes } => {
                    debug!(deployment_id = %self.deployment_id, path = %self.path, bytes, elapsed_ms, "Stream completed");
                }
                SessionOutcome::ClientDisconnected { bytes } => {
                    info!(deployment_id = %self.deployment_id, path = %self.path, bytes, elapsed_ms, "Client disconnected mid-stream");
                }
                SessionOutcome::TimedOut { bytes } => {
                    warn!(deployment_id = %self.deployment_id, path = %self.path, bytes, deadline_secs = self.deadline.as_secs(), "Stream deadline exceeded, closing response");
                }
                SessionOutcome::UpstreamError { bytes, message } => {
                    error!(deployment_id = %self.deployment_id, path = %self.path, bytes, error = %message, "Upstream stream failed");
                }
            }
            outcome
        });

        let body_stream = futures::stream::unfold((rx, aborted), |(mut rx, aborted)| async move {
            match rx.recv().await {
                Some(chunk) => Some((Ok(chunk), (rx, aborted))),
                None if aborted.swap(false, Ordering::SeqCst) => Some((
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "function response aborted",
                    )),
                    (rx, aborted),
                )),
                None => None,
            }
        });

        (Body::from_stream(body_stream), task)
    }
}

/// Forwards dynamic requests to the function execution service.
#[derive(Clone)]
pub struct FunctionProxy {
    client: reqwest::Client,
    executor_url: String,
    stream_timeout: Duration,
    max_body_bytes: usize,
}

impl FunctionProxy {
    pub fn new(
        client: reqwest::Client,
        executor_url: impl Into<String>,
        stream_timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            client,
            executor_url: executor_url.into().trim_end_matches('/').to_string(),
            stream_timeout,
            max_body_bytes,
        }
    }

    /// Outbound headers: inbound minus hop-by-hop, plus routing headers.
    fn outbound_headers(
        &self,
        inbound: &HeaderMap,
        deployment: &ResolvedDeployment,
        resource: &DynamicResource,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(inbound.len() + 4);
        for (name, value) in inbound {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Some(host) = inbound.get(HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }

        let function_path = deployment_key(&deployment.deployment_id, &resource.resource_path);
        headers.insert(X_FUNCTION_PATH, routing_value(&function_path)?);
        headers.insert(X_DEPLOYMENT_ID, routing_value(&deployment.deployment_id)?);
        headers.insert(X_PROJECT_ID, routing_value(&deployment.project_id)?);
        Ok(headers)
    }

    async fn buffered_body(&self, method: &Method, headers: &HeaderMap, body: Body) -> Result<Bytes> {
        if *method == Method::GET || *method == Method::HEAD {
            return Ok(Bytes::new());
        }

        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return Err(GatewayError::BodyTooLarge {
                limit: self.max_body_bytes,
            });
        }

        axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| {
                let too_large = std::error::Error::source(&e)
                    .is_some_and(|s| s.is::<http_body_util::LengthLimitError>());
                if too_large {
                    GatewayError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    }
                } else {
                    GatewayError::Upstream(format!("failed to read request body: {e}"))
                }
            })
    }

    /// Forward `request` to the function bound to `resource`.
    pub async fn forward(
        &self,
        deployment: &ResolvedDeployment,
        resource: &DynamicResource,
        request: Request,
    ) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.executor_url, path_and_query);

        let headers = self.outbound_headers(&parts.headers, deployment, resource)?;
        let body = self.buffered_body(&parts.method, &parts.headers, body).await?;

        debug!(
            deployment_id = %deployment.deployment_id,
            function = %resource.resource_path,
            method = %parts.method,
            url = %url,
            "Proxying to function"
        );

        // One deadline covers response headers and the whole body
        let deadline = tokio::time::Instant::now() + self.stream_timeout;
        let timed_out = || {
            warn!(
                deployment_id = %deployment.deployment_id,
                url = %url,
                timeout_ms = self.stream_timeout.as_millis() as u64,
                "Function execution service did not respond in time"
            );
            GatewayError::UpstreamTimeout {
                timeout_ms: self.stream_timeout.as_millis() as u64,
            }
        };

        let send = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send();
        let upstream = tokio::time::timeout_at(deadline, send)
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| {
                error!(deployment_id = %deployment.deployment_id, url = %url, error = %e, "Function execution service unreachable");
                GatewayError::Upstream(e.to_string())
            })?;

        let status = upstream.status();
        let mut headers = HeaderMap::with_capacity(upstream.headers().len() + 1);
        for (name, value) in upstream.headers() {
            if name != CONTENT_ENCODING
                && name != TRANSFER_ENCODING
                && name != CONTENT_LENGTH
                && name != CONNECTION
                && name != KEEP_ALIVE
            {
                headers.append(name.clone(), value.clone());
            }
        }

        if !has_streamable_body(&parts.method, status, upstream.content_length()) {
            let bytes = tokio::time::timeout_at(deadline, upstream.bytes())
                .await
                .map_err(|_| timed_out())?
                .map_err(|e| GatewayError::Upstream(e.to_string()))?;
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            return Ok(with_parts(status, headers, Body::from(bytes)));
        }

        headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));

        let session = StreamingSession::new(
            deployment.deployment_id.clone(),
            parts.uri.path(),
            deadline.saturating_duration_since(tokio::time::Instant::now()),
        );
        let (body, _task) = session.start(upstream.bytes_stream().map_err(io::Error::other).boxed());

        Ok(with_parts(status, headers, body))
    }
}

/// Responses that carry no body are answered in one buffered write.
fn has_streamable_body(method: &Method, status: StatusCode, content_length: Option<u64>) -> bool {
    *method != Method::HEAD
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
        && content_length != Some(0)
}

fn with_parts(status: StatusCode, headers: HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn routing_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|_| GatewayError::Internal(format!("identifier {value:?} is not a valid header value")))
}
