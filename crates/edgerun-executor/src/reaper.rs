// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for removing stale worker directories.
//!
//! Worker directories (`{workers_root}/{project_id}/{deployment_id}/{hash}/`)
//! hold the materialized entry file of one function. A directory is stale
//! when its entry file has not been accessed for `max_age`, or when it has
//! no entry file at all (an interrupted materialization).
//!
//! The reaper sweeps once at startup and then every `poll_interval`. A
//! directory whose identity is serving a request is skipped and looked at
//! again on the next sweep. Emptied project and deployment directories are
//! left in place. When a deployment environment cache is attached, entries
//! of deployments left without any worker directory are dropped after each
//! sweep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::env::DeploymentEnv;
use crate::identity::WorkerIdentity;
use crate::materialize;
use crate::registry::{EvictOutcome, WorkerRegistry};
use crate::runner::WorkerRunner;

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Root of the worker directory tree.
    pub workers_root: PathBuf,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Entry files untouched for longer than this are removed.
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            workers_root: PathBuf::from(".data/workers"),
            poll_interval: Duration::from_secs(300), // 5 minutes
            max_age: Duration::from_secs(30 * 60),   // 30 minutes
        }
    }
}

/// Counters of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Leaf directories looked at.
    pub scanned: u64,
    /// Directories removed.
    pub removed: u64,
    /// Directories still fresh.
    pub retained: u64,
    /// Directories skipped because a request was using them.
    pub in_use: u64,
    /// Directories or parents that could not be read or removed.
    pub errors: u64,
}

/// Background worker that removes stale worker directories.
pub struct StaleWorkerReaper {
    config: ReaperConfig,
    registry: WorkerRegistry,
    runner: Arc<dyn WorkerRunner>,
    env: Option<DeploymentEnv>,
    shutdown: Arc<Notify>,
}

impl StaleWorkerReaper {
    /// Create a new reaper.
    pub fn new(config: ReaperConfig, registry: WorkerRegistry, runner: Arc<dyn WorkerRunner>) -> Self {
        Self {
            config,
            registry,
            runner,
            env: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Drop cached environments of deployments whose workers are all gone.
    pub fn with_deployment_env(mut self, env: DeploymentEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop.
    ///
    /// Sweeps immediately, then on every interval until the shutdown signal
    /// is received.
    pub async fn run(&self) {
        info!(
            workers_root = %self.config.workers_root.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_minutes = self.config.max_age.as_secs() / 60,
            "Stale worker reaper started"
        );

        self.sweep().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stale worker reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.sweep().await;
                }
            }
        }

        info!("Stale worker reaper stopped");
    }

    /// Scan the worker tree once and remove stale directories.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = SystemTime::now()
            .checked_sub(self.config.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let leaves = match self.leaf_directories(&mut report).await {
            Ok(leaves) => leaves,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workers root does not exist, nothing to sweep");
                return report;
            }
            Err(e) => {
                error!(error = %e, "Failed to read workers root");
                report.errors += 1;
                return report;
            }
        };

        let mut live_deployments = HashSet::new();

        for (dir, identity) in leaves {
            report.scanned += 1;
            let dir = dir.as_path();
            let outcome = match &identity {
                Some(identity) => {
                    self.registry
                        .try_evict(identity, move || {
                            self.evict_if_stale(dir, Some(identity), cutoff)
                        })
                        .await
                }
                // Not a directory any request could use
                None => match self.evict_if_stale(dir, None, cutoff).await {
                    Ok(true) => EvictOutcome::Evicted,
                    Ok(false) => EvictOutcome::Kept,
                    Err(_) => EvictOutcome::Failed,
                },
            };

            if outcome != EvictOutcome::Evicted
                && let Some(deployment) = deployment_name(dir)
            {
                live_deployments.insert(deployment);
            }

            match outcome {
                EvictOutcome::Evicted => report.removed += 1,
                EvictOutcome::Kept => report.retained += 1,
                EvictOutcome::InUse => {
                    debug!(dir = %dir.display(), "Worker in use, skipping");
                    report.in_use += 1;
                }
                EvictOutcome::Failed => report.errors += 1,
            }
        }

        if let Some(env) = &self.env {
            let dropped = env.retain(|deployment| live_deployments.contains(deployment));
            if dropped > 0 {
                debug!(dropped, "Dropped environments of deployments without workers");
            }
        }

        if report.removed > 0 || report.errors > 0 {
            info!(
                scanned = report.scanned,
                removed = report.removed,
                retained = report.retained,
                in_use = report.in_use,
                errors = report.errors,
                "Stale worker sweep complete"
            );
        } else {
            debug!(
                scanned = report.scanned,
                retained = report.retained,
                in_use = report.in_use,
                "Stale worker sweep complete, nothing removed"
            );
        }

        report
    }

    /// Directories three levels below the root, paired with the identity
    /// their names spell, if any.
    async fn leaf_directories(
        &self,
        report: &mut SweepReport,
    ) -> std::io::Result<Vec<(PathBuf, Option<WorkerIdentity>)>> {
        let mut leaves = Vec::new();

        for project in subdirectories(&self.config.workers_root).await? {
            let deployments = match subdirectories(&project).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(dir = %project.display(), error = %e, "Failed to read project directory");
                    report.errors += 1;
                    continue;
                }
            };

            for deployment in deployments {
                let functions = match subdirectories(&deployment).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(dir = %deployment.display(), error = %e, "Failed to read deployment directory");
                        report.errors += 1;
                        continue;
                    }
                };

                for function in functions {
                    let identity = identity_of(&project, &deployment, &function);
                    leaves.push((function, identity));
                }
            }
        }

        Ok(leaves)
    }

    /// Remove `dir` if its entry file is missing or older than `cutoff`.
    async fn evict_if_stale(
        &self,
        dir: &Path,
        identity: Option<&WorkerIdentity>,
        cutoff: SystemTime,
    ) -> std::io::Result<bool> {
        let reason = match materialize::find_entry(dir).await {
            None => "no entry file",
            Some(entry) => {
                let last_used = match materialize::last_used(&entry).await {
                    Ok(t) => t,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => SystemTime::now(),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Failed to stat entry file");
                        return Err(e);
                    }
                };
                if last_used >= cutoff {
                    return Ok(false);
                }
                "expired"
            }
        };

        if let Some(identity) = identity
            && let Err(e) = self.runner.release(identity).await
        {
            warn!(worker = %identity, error = %e, "Failed to stop worker before removal");
        }

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to remove worker directory");
                return Err(e);
            }
        }

        info!(dir = %dir.display(), reason, "Removed stale worker directory");
        Ok(true)
    }
}

async fn subdirectories(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn deployment_name(function_dir: &Path) -> Option<String> {
    function_dir
        .parent()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

fn identity_of(project: &Path, deployment: &Path, function: &Path) -> Option<WorkerIdentity> {
    let name = |p: &Path| p.file_name().and_then(|n| n.to_str()).map(str::to_string);
    WorkerIdentity::from_components(&name(project)?, &name(deployment)?, &name(function)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;
    use tempfile::TempDir;

    const MAX_AGE: Duration = Duration::from_secs(30 * 60);

    fn reaper(root: &Path, runner: Arc<MockRunner>) -> (StaleWorkerReaper, WorkerRegistry) {
        let registry = WorkerRegistry::new();
        let reaper = StaleWorkerReaper::new(
            ReaperConfig {
                workers_root: root.to_path_buf(),
                poll_interval: Duration::from_secs(3600),
                max_age: MAX_AGE,
            },
            registry.clone(),
            runner,
        );
        (reaper, registry)
    }

    fn worker_dir(root: &Path, function_path: &str, age: Option<Duration>) -> (PathBuf, WorkerIdentity) {
        let identity = WorkerIdentity::new("p1", "d1", function_path).unwrap();
        let dir = identity.dir(root);
        std::fs::create_dir_all(&dir).unwrap();
        if let Some(age) = age {
            let entry = dir.join("entry.js");
            std::fs::write(&entry, "export default 1;").unwrap();
            let at = SystemTime::now() - age;
            std::fs::File::options()
                .append(true)
                .open(&entry)
                .unwrap()
                .set_times(std::fs::FileTimes::new().set_accessed(at).set_modified(at))
                .unwrap();
        }
        (dir, identity)
    }

    #[tokio::test]
    async fn test_missing_root_is_empty_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let (reaper, _) = reaper(&temp_dir.path().join("absent"), Arc::new(MockRunner::new()));
        assert_eq!(reaper.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_removes_only_expired_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let (old, old_id) = worker_dir(root, "old.js", Some(MAX_AGE + Duration::from_secs(60)));
        let (fresh, _) = worker_dir(root, "fresh.js", Some(MAX_AGE - Duration::from_secs(60)));
        let runner = Arc::new(MockRunner::new());
        let (reaper, _) = reaper(root, runner.clone());

        let report = reaper.sweep().await;

        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.retained, 1);
        assert!(!old.exists());
        assert!(fresh.join("entry.js").exists());
        assert_eq!(runner.released().await, vec![old_id]);
    }

    #[tokio::test]
    async fn test_removes_directory_without_entry() {
        let temp_dir = TempDir::new().unwrap();
        let (partial, _) = worker_dir(temp_dir.path(), "partial.js", None);
        std::fs::write(partial.join(".0b1c.tmp"), "half").unwrap();
        let (reaper, _) = reaper(temp_dir.path(), Arc::new(MockRunner::new()));

        let report = reaper.sweep().await;
        assert_eq!(report.removed, 1);
        assert!(!partial.exists());
        // Parents are kept
        assert!(temp_dir.path().join("p1/d1").exists());
    }

    #[tokio::test]
    async fn test_leased_directory_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (dir, identity) = worker_dir(temp_dir.path(), "busy.js", Some(MAX_AGE * 2));
        let (reaper, registry) = reaper(temp_dir.path(), Arc::new(MockRunner::new()));

        let lease = registry.acquire(&identity);
        let report = reaper.sweep().await;
        assert_eq!(report.in_use, 1);
        assert!(dir.exists());

        drop(lease);
        let report = reaper.sweep().await;
        assert_eq!(report.removed, 1);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_unrecognized_directories_are_swept() {
        let temp_dir = TempDir::new().unwrap();
        let odd = temp_dir.path().join("p1/d1/not-a-hash");
        std::fs::create_dir_all(&odd).unwrap();
        std::fs::write(temp_dir.path().join("p1/stray-file"), "x").unwrap();
        let (reaper, _) = reaper(temp_dir.path(), Arc::new(MockRunner::new()));

        let report = reaper.sweep().await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.removed, 1);
        assert!(!odd.exists());
    }

    #[tokio::test]
    async fn test_sweep_drops_env_of_deployments_without_workers() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        worker_dir(root, "old.js", Some(MAX_AGE * 2));
        let kept = WorkerIdentity::new("p1", "d2", "fresh.js").unwrap();
        std::fs::create_dir_all(kept.dir(root)).unwrap();
        std::fs::write(kept.dir(root).join("entry.js"), "export default 2;").unwrap();

        let env = DeploymentEnv::new(
            Default::default(),
            Arc::new(edgerun_core::object_store::MemoryObjectStore::new()),
        );
        for deployment in ["d1", "d2", "d3"] {
            env.resolve(deployment).await;
        }
        let (reaper, _) = reaper(root, Arc::new(MockRunner::new()));
        let reaper = reaper.with_deployment_env(env.clone());

        let report = reaper.sweep().await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.retained, 1);
        assert!(!env.is_cached("d1"));
        assert!(env.is_cached("d2"));
        assert!(!env.is_cached("d3"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let (reaper, _) = reaper(temp_dir.path(), Arc::new(MockRunner::new()));
        let reaper = Arc::new(reaper);
        let shutdown = reaper.shutdown_handle();

        let handle = tokio::spawn({
            let reaper = reaper.clone();
            async move { reaper.run().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
