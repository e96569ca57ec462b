// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-identity coordination between dispatching requests and the reaper.
//!
//! Every identity has a slot holding:
//! - a lease count: one lease per in-flight request (held until the response
//!   body is fully sent)
//! - a state gate: an async mutex serializing materialization and eviction
//! - the observable [`WorkerState`] and `lastAccessedAt`
//!
//! Rules:
//! - a request takes a lease first, then the gate, and only materializes
//!   while holding the gate, so one identity is materialized at most once
//!   concurrently
//! - the reaper evicts only when it wins the gate without waiting and no
//!   lease is outstanding; requests that arrive meanwhile wait on the gate
//!   and find the directory gone
//! - slots are removed from the map only when no lease is outstanding

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::identity::WorkerIdentity;

/// Lifecycle state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Absent,
    Materializing,
    Ready,
    /// Ready, with at least one request in flight.
    Busy,
    Evicted,
}

impl WorkerState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Materializing => 1,
            Self::Ready | Self::Busy => 2,
            Self::Evicted => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Materializing,
            2 => Self::Ready,
            3 => Self::Evicted,
            _ => Self::Absent,
        }
    }
}

struct Slot {
    leases: AtomicUsize,
    gate: Mutex<()>,
    phase: AtomicU8,
    last_accessed_ms: AtomicI64,
}

impl Slot {
    fn new() -> Self {
        Self {
            leases: AtomicUsize::new(0),
            gate: Mutex::new(()),
            phase: AtomicU8::new(WorkerState::Absent.to_u8()),
            last_accessed_ms: AtomicI64::new(0),
        }
    }

    fn phase(&self) -> WorkerState {
        WorkerState::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, state: WorkerState) {
        self.phase.store(state.to_u8(), Ordering::Release);
    }

    fn observed_state(&self) -> WorkerState {
        match self.phase() {
            WorkerState::Ready if self.leases.load(Ordering::Acquire) > 0 => WorkerState::Busy,
            other => other,
        }
    }

    fn last_accessed_at(&self) -> Option<DateTime<Utc>> {
        match self.last_accessed_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// Result of [`WorkerRegistry::try_evict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The eviction ran and removed the worker.
    Evicted,
    /// The eviction ran and decided to keep the worker.
    Kept,
    /// A request holds a lease or the gate; nothing was done.
    InUse,
    /// The eviction ran and failed.
    Failed,
}

/// Snapshot of one identity, as served by `GET /_edgerun/workers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub identity: WorkerIdentity,
    pub state: WorkerState,
    pub leases: usize,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Registry of identity slots. Cheap to clone.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    slots: Arc<DashMap<WorkerIdentity, Arc<Slot>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a lease on `identity`. The lease blocks eviction until dropped.
    pub fn acquire(&self, identity: &WorkerIdentity) -> WorkerLease {
        let slot = {
            let entry = self
                .slots
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Slot::new()));
            // Incremented under the shard lock so removal never races a new lease
            entry.leases.fetch_add(1, Ordering::AcqRel);
            entry.clone()
        };
        WorkerLease {
            registry: self.clone(),
            identity: identity.clone(),
            slot,
        }
    }

    /// Evict `identity` if no request is using it.
    ///
    /// `evict` runs while holding the gate with no lease outstanding. It
    /// returns `Ok(true)` if the worker was removed, `Ok(false)` if it decided
    /// to keep it.
    pub async fn try_evict<F, Fut>(&self, identity: &WorkerIdentity, evict: F) -> EvictOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::io::Result<bool>>,
    {
        let slot = self
            .slots
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        let outcome = {
            let Ok(_gate) = slot.gate.try_lock() else {
                return EvictOutcome::InUse;
            };
            if slot.leases.load(Ordering::Acquire) > 0 {
                return EvictOutcome::InUse;
            }

            match evict().await {
                Ok(true) => {
                    slot.set_phase(WorkerState::Evicted);
                    EvictOutcome::Evicted
                }
                Ok(false) => EvictOutcome::Kept,
                Err(e) => {
                    debug!(identity = %identity, error = %e, "Eviction failed");
                    EvictOutcome::Failed
                }
            }
        };

        if outcome != EvictOutcome::Kept {
            self.slots.remove_if(identity, |_, s| {
                Arc::ptr_eq(s, &slot) && s.leases.load(Ordering::Acquire) == 0
            });
        }
        outcome
    }

    /// Current state of `identity`.
    pub fn state(&self, identity: &WorkerIdentity) -> WorkerState {
        self.slots
            .get(identity)
            .map(|slot| slot.observed_state())
            .unwrap_or(WorkerState::Absent)
    }

    /// Snapshot of every known identity, ordered by identity.
    pub fn list(&self) -> Vec<WorkerStatus> {
        let mut workers: Vec<WorkerStatus> = self
            .slots
            .iter()
            .map(|entry| WorkerStatus {
                identity: entry.key().clone(),
                state: entry.value().observed_state(),
                leases: entry.value().leases.load(Ordering::Acquire),
                last_accessed_at: entry.value().last_accessed_at(),
            })
            .collect();
        workers.sort_by(|a, b| a.identity.cmp(&b.identity));
        workers
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A request's hold on one identity.
pub struct WorkerLease {
    registry: WorkerRegistry,
    identity: WorkerIdentity,
    slot: Arc<Slot>,
}

impl WorkerLease {
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Wait for the identity's state gate.
    pub async fn lock(&self) -> WorkerGuard<'_> {
        WorkerGuard {
            _gate: self.slot.gate.lock().await,
            slot: &self.slot,
        }
    }

    /// Record a successful dispatch.
    pub fn touch(&self) {
        self.slot
            .last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let previous = self.slot.leases.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.slot.phase() == WorkerState::Absent {
            // Failed materialization leaves nothing worth tracking
            self.registry.slots.remove_if(&self.identity, |_, s| {
                Arc::ptr_eq(s, &self.slot)
                    && s.leases.load(Ordering::Acquire) == 0
                    && s.phase() == WorkerState::Absent
            });
        }
    }
}

/// Exclusive access to an identity's state.
pub struct WorkerGuard<'a> {
    _gate: MutexGuard<'a, ()>,
    slot: &'a Slot,
}

impl WorkerGuard<'_> {
    pub fn state(&self) -> WorkerState {
        self.slot.phase()
    }

    pub fn set_state(&self, state: WorkerState) {
        self.slot.set_phase(state);
    }
}
