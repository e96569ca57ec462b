// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker output fan-out.
//!
//! Runners pipe worker stdout/stderr through [`LogHub::pump`], which mirrors
//! each line into `tracing` and publishes it on a bounded broadcast channel.
//! Subscribers that fall behind skip the lines they missed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identity::WorkerIdentity;

/// Default number of lines buffered per subscriber.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of worker output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub project_id: String,
    pub deployment_id: String,
    pub function_hash: String,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast hub for worker output. Cheap to clone.
#[derive(Clone)]
pub struct LogHub {
    tx: broadcast::Sender<Arc<LogLine>>,
    closed: CancellationToken,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Publish one line. Dropped when nobody is subscribed.
    pub fn publish(&self, identity: &WorkerIdentity, stream: LogStream, line: impl Into<String>) {
        let _ = self.tx.send(Arc::new(LogLine {
            project_id: identity.project_id.clone(),
            deployment_id: identity.deployment_id.clone(),
            function_hash: identity.function_hash.clone(),
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        }));
    }

    /// Forward every line of `reader` until EOF. Invalid UTF-8 is replaced,
    /// never fatal, so the worker's pipe is always drained.
    pub fn pump<R>(&self, identity: &WorkerIdentity, stream: LogStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let hub = self.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        debug!(worker = %identity, stream = ?stream, "{}", line);
                        hub.publish(&identity, stream, line);
                    }
                    Err(e) => {
                        debug!(worker = %identity, error = %e, "Worker output closed");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe to lines, optionally only those of one deployment.
    pub fn subscribe(&self, deployment_id: Option<String>) -> LogSubscription {
        LogSubscription {
            rx: self.tx.subscribe(),
            deployment_id,
            token: self.closed.child_token(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// End every subscription.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// A live view of worker output.
pub struct LogSubscription {
    rx: broadcast::Receiver<Arc<LogLine>>,
    deployment_id: Option<String>,
    token: CancellationToken,
}

impl LogSubscription {
    /// Next matching line, or `None` once cancelled or the hub is closed.
    pub async fn next(&mut self) -> Option<Arc<LogLine>> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                received = self.rx.recv() => received,
            };
            match received {
                Ok(line) => {
                    if self
                        .deployment_id
                        .as_deref()
                        .is_none_or(|d| d == line.deployment_id)
                    {
                        return Some(line);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Log subscriber lagged, dropped lines");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Stop this subscription. Pending and future `next` calls return `None`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token that cancels this subscription.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Arc<LogLine>> + Send + 'static {
        async_stream::stream! {
            while let Some(line) = self.next().await {
                yield line;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(deployment: &str) -> WorkerIdentity {
        WorkerIdentity::new("p1", deployment, "f.js").unwrap()
    }

    #[tokio::test]
    async fn test_subscription_filters_by_deployment() {
        let hub = LogHub::new(16);
        let mut sub = hub.subscribe(Some("d2".to_string()));

        hub.publish(&identity("d1"), LogStream::Stdout, "one");
        hub.publish(&identity("d2"), LogStream::Stderr, "two");

        let line = sub.next().await.unwrap();
        assert_eq!(line.line, "two");
        assert_eq!(line.stream, LogStream::Stderr);
        assert_eq!(line.deployment_id, "d2");
    }

    #[tokio::test]
    async fn test_pump_publishes_lines() {
        let hub = LogHub::new(16);
        let mut sub = hub.subscribe(None);

        hub.pump(&identity("d1"), LogStream::Stdout, &b"first\nsecond\n"[..])
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().line, "first");
        assert_eq!(sub.next().await.unwrap().line, "second");
    }

    #[tokio::test]
    async fn test_pump_survives_invalid_utf8() {
        let hub = LogHub::new(16);
        let mut sub = hub.subscribe(None);

        hub.pump(
            &identity("d1"),
            LogStream::Stderr,
            &b"first\n\xff\xfe bad\r\nafter"[..],
        )
        .await
        .unwrap();

        assert_eq!(sub.next().await.unwrap().line, "first");
        assert_eq!(sub.next().await.unwrap().line, "\u{FFFD}\u{FFFD} bad");
        assert_eq!(sub.next().await.unwrap().line, "after");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let hub = LogHub::new(2);
        let mut sub = hub.subscribe(None);
        for i in 0..5 {
            hub.publish(&identity("d1"), LogStream::Stdout, i.to_string());
        }

        assert_eq!(sub.next().await.unwrap().line, "3");
        assert_eq!(sub.next().await.unwrap().line, "4");
    }

    #[tokio::test]
    async fn test_cancel_ends_pending_next() {
        let hub = LogHub::new(16);
        let mut sub = hub.subscribe(None);
        let token = sub.cancel_token();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_all_subscriptions() {
        let hub = LogHub::new(16);
        let mut a = hub.subscribe(None);
        let mut b = hub.subscribe(Some("d1".to_string()));
        hub.close();

        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }
}
