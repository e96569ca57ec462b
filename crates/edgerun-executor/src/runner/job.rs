// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One short-lived process per request.
//!
//! The request is written to the job's stdin as one JSON document:
//!
//! ```json
//! {"method": "POST", "path": "/api/users?page=2", "headers": {"content-type": "application/json"}, "body": "<base64>"}
//! ```
//!
//! and the job prints its response on stdout:
//!
//! ```json
//! {"status": 201, "headers": {"content-type": "text/plain"}, "body": "created"}
//! ```
//!
//! Repeated request headers are combined into one value, joined with `; `
//! for `cookie` and `, ` otherwise. `body` is UTF-8 text unless
//! `"encoding": "base64"` is set. Stderr goes to
//! the log hub. The job is killed when the execution timeout elapses.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::command::WorkerCommand;
use super::traits::*;
use crate::logs::{LogHub, LogStream};

/// Stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    method: &'a str,
    path: &'a str,
    headers: BTreeMap<&'a str, String>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    encoding: Option<String>,
}

impl JobResponse {
    fn into_worker_response(self) -> Result<WorkerResponse> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| RunnerError::Protocol(format!("invalid status {}", self.status)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| RunnerError::Protocol(format!("invalid header name {:?}", name)))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| RunnerError::Protocol(format!("invalid value for header {}", name)))?;
            headers.append(name, value);
        }

        let body = match self.encoding.as_deref() {
            Some("base64") => Bytes::from(
                BASE64
                    .decode(self.body.as_bytes())
                    .map_err(|e| RunnerError::Protocol(format!("invalid base64 body: {}", e)))?,
            ),
            None | Some("utf8") | Some("utf-8") => Bytes::from(self.body),
            Some(other) => {
                return Err(RunnerError::Protocol(format!(
                    "unsupported body encoding {:?}",
                    other
                )));
            }
        };

        Ok(WorkerResponse {
            status,
            headers,
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        })
    }
}

fn encode_request(request: &WorkerRequest) -> Result<Vec<u8>> {
    let mut headers: BTreeMap<&str, String> = BTreeMap::new();
    for (name, value) in &request.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let separator = if name == COOKIE { "; " } else { ", " };
        headers
            .entry(name.as_str())
            .and_modify(|joined| {
                joined.push_str(separator);
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    Ok(serde_json::to_vec(&JobRequest {
        method: request.method.as_str(),
        path: &request.path_and_query,
        headers,
        body: BASE64.encode(&request.body),
    })?)
}

/// Runner starting one process per request.
pub struct JobRunner {
    command: WorkerCommand,
    logs: LogHub,
}

impl JobRunner {
    pub fn new(command: WorkerCommand, logs: LogHub) -> Self {
        Self { command, logs }
    }
}

#[async_trait]
impl WorkerRunner for JobRunner {
    fn runner_type(&self) -> &'static str {
        "job"
    }

    async fn execute(&self, spec: &WorkerSpec, request: WorkerRequest) -> Result<WorkerResponse> {
        let deadline = Instant::now() + spec.timeout;
        let input = encode_request(&request)?;

        let mut child = self
            .command
            .command(spec, None)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::StartFailed(format!("{}: {}", self.command.program, e)))?;
        let started = Instant::now();
        debug!(worker = %spec.identity, pid = child.id(), "Job started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::Other("job stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Other("job stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        let writer = tokio::spawn(async move {
            // A job may exit without reading its input
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = stderr.map(|stderr| {
            let logs = self.logs.clone();
            let identity = spec.identity.clone();
            tokio::spawn(async move {
                let mut tail = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.publish(&identity, LogStream::Stderr, line.clone());
                    if tail.len() < STDERR_TAIL_BYTES {
                        if !tail.is_empty() {
                            tail.push('\n');
                        }
                        tail.push_str(&line);
                    }
                }
                tail
            })
        });

        let status = match timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(worker = %spec.identity, "Job exceeded execution timeout, killing");
                let _ = child.kill().await;
                writer.abort();
                reader.abort();
                return Err(RunnerError::Timeout);
            }
        };
        let _ = writer.await;

        let stdout = match timeout_at(deadline, reader).await {
            Ok(joined) => joined.map_err(|e| RunnerError::Other(e.to_string()))??,
            Err(_) => {
                warn!(worker = %spec.identity, "Job output not closed before execution timeout");
                return Err(RunnerError::Timeout);
            }
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            warn!(worker = %spec.identity, exit_code, stderr = %stderr, "Job failed");
            return Err(RunnerError::ExitCode { exit_code, stderr });
        }

        let response: JobResponse = serde_json::from_slice(&stdout)
            .map_err(|e| RunnerError::Protocol(format!("invalid job response: {}", e)))?;

        info!(
            worker = %spec.identity,
            status = response.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Job completed"
        );
        response.into_worker_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::WorkerIdentity;
    use axum::http::Method;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, timeout: Duration, extra: &[(&str, &str)]) -> WorkerSpec {
        let mut env = HashMap::from([(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
        )]);
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        WorkerSpec {
            identity: WorkerIdentity::new("p1", "d1", "f.js").unwrap(),
            work_dir: dir.path().to_path_buf(),
            entry: dir.path().join("entry.js"),
            env: Arc::new(env),
            memory_mb: 64,
            timeout,
        }
    }

    fn shell(script: &str) -> JobRunner {
        JobRunner::new(
            WorkerCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
            LogHub::default(),
        )
    }

    fn request() -> WorkerRequest {
        WorkerRequest {
            method: Method::POST,
            path_and_query: "/api/users?page=2".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"hello"),
        }
    }

    async fn collect(response: WorkerResponse) -> Bytes {
        let mut body = response.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.unwrap());
        }
        Bytes::from(buf)
    }

    #[test]
    fn test_request_encoding() {
        let mut req = request();
        req.headers
            .insert("content-type", HeaderValue::from_static("text/plain"));
        let json: serde_json::Value = serde_json::from_slice(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/api/users?page=2");
        assert_eq!(json["headers"]["content-type"], "text/plain");
        assert_eq!(json["body"], "aGVsbG8=");
    }

    #[test]
    fn test_repeated_headers_are_combined() {
        let mut req = request();
        req.headers.append("accept", HeaderValue::from_static("text/html"));
        req.headers.append("accept", HeaderValue::from_static("application/json"));
        req.headers.append("cookie", HeaderValue::from_static("a=1"));
        req.headers.append("cookie", HeaderValue::from_static("b=2"));
        let json: serde_json::Value = serde_json::from_slice(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(json["headers"]["accept"], "text/html, application/json");
        assert_eq!(json["headers"]["cookie"], "a=1; b=2");
    }

    #[tokio::test]
    async fn test_job_response_is_returned() {
        let dir = TempDir::new().unwrap();
        let runner = shell(
            r#"cat > /dev/null; echo '{"status": 201, "headers": {"content-type": "text/plain"}, "body": "created"}'"#,
        );

        let response = runner
            .execute(&spec(&dir, Duration::from_secs(5), &[]), request())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["content-type"], "text/plain");
        assert_eq!(&collect(response).await[..], b"created");
    }

    #[tokio::test]
    async fn test_base64_body_is_decoded() {
        let dir = TempDir::new().unwrap();
        let runner = shell(r#"echo '{"status": 200, "body": "aGk=", "encoding": "base64"}'"#);

        let response = runner
            .execute(&spec(&dir, Duration::from_secs(5), &[]), request())
            .await
            .unwrap();
        assert_eq!(&collect(response).await[..], b"hi");
    }

    #[tokio::test]
    async fn test_job_sees_merged_env() {
        let dir = TempDir::new().unwrap();
        let runner = shell(r#"printf '{"status": 200, "body": "%s"}' "$GREETING""#);

        let response = runner
            .execute(
                &spec(&dir, Duration::from_secs(5), &[("GREETING", "hola")]),
                request(),
            )
            .await
            .unwrap();
        assert_eq!(&collect(response).await[..], b"hola");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = TempDir::new().unwrap();
        let runner = shell("echo boom >&2; exit 3");

        let err = runner
            .execute(&spec(&dir, Duration::from_secs(5), &[]), request())
            .await
            .unwrap_err();
        match err {
            RunnerError::ExitCode { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let dir = TempDir::new().unwrap();
        let runner = shell("sleep 30");

        let started = std::time::Instant::now();
        let err = runner
            .execute(&spec(&dir, Duration::from_millis(200), &[]), request())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_garbage_output_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let runner = shell("echo not-json");

        let err = runner
            .execute(&spec(&dir, Duration::from_secs(5), &[]), request())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }
}
