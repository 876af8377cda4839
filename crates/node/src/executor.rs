//! Worker pool that pulls scheduled work from the manager within the resource
//! budget of the executor service.

use crate::error::SpResult;
use crate::gc::GcDriver;
use crate::manager::Manager;
use crate::rcmgr::ResourceScope;
use crate::replicator::{Replication, Replicator};
use crate::task::{Task, TaskKind, TaskType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const EXECUTOR_SERVICE: &str = "executor";

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub workers: usize,
    /// Pause after an empty poll.
    pub backoff: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff: Duration::from_secs(1),
        }
    }
}

pub struct Executor {
    manager: Arc<Manager>,
    replicator: Arc<Replicator>,
    gc: Arc<GcDriver>,
    scope: Arc<ResourceScope>,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(
        manager: Arc<Manager>,
        replicator: Arc<Replicator>,
        gc: Arc<GcDriver>,
        scope: Arc<ResourceScope>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            manager,
            replicator,
            gc,
            scope,
            options,
        }
    }

    /// Spawns the workers; each stops when `shutdown` flips.
    pub fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.options.workers.max(1);
        info!(workers, "Executor started");
        (0..workers)
            .map(|worker| {
                let this = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        if this.run_once().await {
                            continue;
                        }
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(this.options.backoff) => {}
                        }
                    }
                    debug!(worker, "Executor worker stopped");
                })
            })
            .collect()
    }

    /// Pulls and runs at most one task. Returns whether a task ran.
    pub async fn run_once(&self) -> bool {
        let span = match self.scope.begin_span() {
            Ok(span) => span,
            Err(err) => {
                warn!(error = %err, "Failed to begin executor span");
                return false;
            }
        };
        // admit against what the service has left, not the fresh span
        let budget = self.scope.remaining();
        let allocated = self
            .manager
            .alloc_task_with(&budget, |task| span.reserve_resources(&task.estimate_stat()));
        let Some(mut task) = allocated else {
            span.done();
            return false;
        };
        debug!(task = %task, "Executing task");

        let outcome = match task.task_type() {
            TaskType::ReplicatePiece => self.replicate(&mut task).await,
            TaskType::SealObject => self.seal(&task).await,
            TaskType::GcObject => self.gc.run(&mut task).await,
            other => {
                error!(task_type = other.name(), "Executor got a task it does not run");
                span.done();
                return false;
            }
        };
        if let Err(err) = &outcome {
            task.set_error(err);
        }
        let reported = match task.kind {
            TaskKind::ReplicatePiece(_) => self.manager.done_replicate_piece_task(task).await,
            TaskKind::SealObject(_) => self.manager.done_seal_object_task(task).await,
            _ => self.manager.done_gc_object_task(task).await,
        };
        if let Err(err) = reported {
            warn!(error = %err, "Failed to report task result");
        }
        // closing the span hands the reservation back
        span.done();
        true
    }

    async fn seal(&self, task: &Task) -> SpResult<()> {
        let TaskKind::SealObject(seal) = &task.kind else {
            return Ok(());
        };
        let replication = Replication {
            secondary_addresses: seal.secondary_addresses.clone(),
            secondary_signatures: seal.secondary_signatures.clone(),
        };
        self.replicator.seal(&seal.object_info, &replication).await
    }

    /// Replicates, then tries to seal right away so the common case needs no
    /// separate seal task.
    async fn replicate(&self, task: &mut Task) -> SpResult<()> {
        let TaskKind::ReplicatePiece(replicate) = &mut task.kind else {
            return Ok(());
        };
        let replication = self
            .replicator
            .replicate(&replicate.object_info, replicate.storage_params)
            .await?;
        replicate.secondary_addresses = replication.secondary_addresses.clone();
        replicate.secondary_signatures = replication.secondary_signatures.clone();
        match self.replicator.seal(&replicate.object_info, &replication).await {
            Ok(()) => replicate.sealed = true,
            Err(err) => {
                warn!(object_id = %replicate.object_info.id, error = %err, "Inline seal failed, leaving it to a seal task");
            }
        }
        Ok(())
    }
}
