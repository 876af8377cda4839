//! Scheduler for the upload → replicate → seal pipeline and the rolling gc-object
//! windows. Executors pull work through `alloc_task` and report back through the
//! `done_*` entry points.

use crate::config::{GcConfig, ManagerConfig, NodeConfig, QueueConfig};
use crate::error::{SpError, SpResult};
use crate::interfaces::{Chain, JobState, MetadataDb};
use crate::peers::PeerDirectory;
use crate::queue::{CollectionFn, PriorityQueue, QueueState, Strategy, TaskQueue};
use crate::rcmgr::ResourceLimit;
use crate::task::{now_secs, Task, TaskConfig, TaskKind, TaskPriorities, TaskType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_protocol::ObjectId;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const PRIORITY_QUEUE_MANAGE: &str = "priority-queue-manager";
pub const SUB_QUEUE_UPLOAD: &str = "sub-queue-upload";
pub const SUB_QUEUE_REPLICATE_PIECE: &str = "sub-queue-replicate-piece";
pub const SUB_QUEUE_SEAL_OBJECT: &str = "sub-queue-seal-object";
pub const SUB_QUEUE_GC_OBJECT: &str = "sub-queue-gc-object";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub max_upload_concurrent: usize,
    pub task: TaskConfig,
    pub queue: QueueConfig,
    pub timers: ManagerConfig,
    pub gc: GcConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

impl ManagerOptions {
    pub fn from_config(cfg: &NodeConfig) -> Self {
        Self {
            max_upload_concurrent: cfg.max_upload_concurrent,
            task: cfg.task.clone(),
            queue: cfg.queue.clone(),
            timers: cfg.manager.clone(),
            gc: cfg.gc.clone(),
        }
    }
}

/// Why an upload was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefuseReason {
    TaskRepeated,
    ExceedUploadParallel,
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::TaskRepeated => f.write_str("repeated_task"),
            RefuseReason::ExceedUploadParallel => f.write_str("exceed_upload_parallel"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SubQueuePriorities {
    upload: u8,
    replicate: u8,
    seal: u8,
}

/// Restores timed-out gc-object windows and appends new ones while the queue has
/// room and the chain is far enough ahead of the frontier.
fn gc_object_collection(
    frontier: Arc<AtomicU64>,
    height: Arc<AtomicU64>,
    task_config: TaskConfig,
    gc: GcConfig,
) -> CollectionFn {
    Arc::new(move |state: &mut QueueState| {
        for key in state.keys() {
            if !state.get(&key).is_some_and(|t| t.expired()) {
                continue;
            }
            let Some(mut task) = state.pop_by_key(&key) else {
                continue;
            };
            let now = now_secs();
            task.create_time = now;
            task.update_time = now;
            task.retry = 0;
            task.error = None;
            debug!(key = %task.key, "Restoring expired gc object task");
            if let Err(err) = state.push(task) {
                warn!(key = %key, error = %err, "Failed to restore gc object task");
            }
        }
        if state.len() >= state.cap() {
            return;
        }
        let Some(ceiling) = height.load(Ordering::Acquire).checked_sub(gc.block_distance) else {
            return;
        };
        loop {
            let start = frontier.load(Ordering::Acquire);
            let end = start.saturating_add(gc.block_interval);
            if end > ceiling {
                break;
            }
            if state.push(task_config.gc_object_task(start + 1, end)).is_err() {
                break;
            }
            frontier.store(end, Ordering::Release);
            info!(start_block = start + 1, end_block = end, "Generated gc object task");
        }
    })
}

/// Collection that removes the tasks `drop_when` matches and parks them in
/// `dropped` so `Manager::collect` can record their failed job state.
fn recording_collection(dropped: Arc<Mutex<Vec<Task>>>, drop_when: fn(&Task) -> bool) -> CollectionFn {
    Arc::new(move |state: &mut QueueState| {
        let removed = state.remove_where(drop_when);
        if removed.is_empty() {
            return;
        }
        for task in &removed {
            warn!(queue = state.name(), task = %task, "Collected abandoned task");
        }
        dropped.lock().unwrap_or_else(|e| e.into_inner()).extend(removed);
    })
}

/// Job state a task leaves behind when it is dropped for good.
fn failed_state(task: &Task) -> Option<(ObjectId, JobState)> {
    match &task.kind {
        TaskKind::UploadObject(t) => Some((t.object_info.id, JobState::UploadObjectError)),
        TaskKind::ReplicatePiece(t) => Some((t.object_info.id, JobState::ReplicateObjectError)),
        TaskKind::SealObject(t) => Some((t.object_info.id, JobState::SealObjectError)),
        _ => None,
    }
}

/// `true` when `next` does not go behind `prev` in (block, object id) order.
fn progress_in_order(prev: &Task, next: &Task) -> bool {
    match (&prev.kind, &next.kind) {
        (TaskKind::GcObject(p), TaskKind::GcObject(n)) => {
            (n.current_block, n.last_deleted_object_id) >= (p.current_block, p.last_deleted_object_id)
        }
        _ => false,
    }
}

pub struct Manager {
    queue: Arc<PriorityQueue>,
    options: ManagerOptions,
    metadb: Arc<dyn MetadataDb>,
    chain: Arc<dyn Chain>,
    peers: Option<Arc<PeerDirectory>>,
    height: Arc<AtomicU64>,
    gc_frontier: Arc<AtomicU64>,
    priorities: SubQueuePriorities,
    dropped: Arc<Mutex<Vec<Task>>>,
}

impl Manager {
    pub fn new(options: ManagerOptions, metadb: Arc<dyn MetadataDb>, chain: Arc<dyn Chain>) -> Self {
        let map = TaskPriorities::global();
        let priorities = SubQueuePriorities {
            upload: map.priority(TaskType::UploadObject),
            replicate: map.priority(TaskType::ReplicatePiece),
            seal: map.priority(TaskType::SealObject),
        };
        let gc_priority = map.priority(TaskType::GcObject);
        let height = Arc::new(AtomicU64::new(0));
        let gc_frontier = Arc::new(AtomicU64::new(options.gc.frontier));
        let dropped = Arc::new(Mutex::new(Vec::new()));

        let upload = TaskQueue::new(
            SUB_QUEUE_UPLOAD,
            options.queue.upload_capacity,
            Strategy::timeout_policy().with_collection(recording_collection(dropped.clone(), Task::expired)),
            false,
        );
        let replicate = TaskQueue::new(
            SUB_QUEUE_REPLICATE_PIECE,
            options.queue.replicate_capacity,
            Strategy::retry_policy().with_collection(recording_collection(dropped.clone(), Task::active)),
            true,
        );
        let seal = TaskQueue::new(
            SUB_QUEUE_SEAL_OBJECT,
            options.queue.seal_capacity,
            Strategy::retry_policy().with_collection(recording_collection(dropped.clone(), Task::active)),
            true,
        );
        let gc_object = TaskQueue::new(
            SUB_QUEUE_GC_OBJECT,
            options.queue.gc_object_capacity,
            Strategy::retry_policy().with_collection(gc_object_collection(
                gc_frontier.clone(),
                height.clone(),
                options.task.clone(),
                options.gc.clone(),
            )),
            true,
        );
        let queues = BTreeMap::from([
            (priorities.upload, Arc::new(upload)),
            (priorities.replicate, Arc::new(replicate)),
            (priorities.seal, Arc::new(seal)),
            (gc_priority, Arc::new(gc_object)),
        ]);

        Self {
            queue: Arc::new(PriorityQueue::new(PRIORITY_QUEUE_MANAGE, queues)),
            options,
            metadb,
            chain,
            peers: None,
            height,
            gc_frontier,
            priorities,
            dropped,
        }
    }

    /// SP list refreshes also update the overlay's peer grouping.
    pub fn with_peers(mut self, peers: Arc<PeerDirectory>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn task_config(&self) -> &TaskConfig {
        &self.options.task
    }

    pub fn gc_frontier(&self) -> u64 {
        self.gc_frontier.load(Ordering::Acquire)
    }

    pub fn set_gc_frontier(&self, block: u64) {
        self.gc_frontier.store(block, Ordering::Release);
    }

    /// Upload, replicate and seal tasks still in the pipeline.
    pub fn uploading_count(&self) -> usize {
        self.queue.sub_queue_len(self.priorities.upload)
            + self.queue.sub_queue_len(self.priorities.replicate)
            + self.queue.sub_queue_len(self.priorities.seal)
    }

    async fn update_state(&self, object_id: ObjectId, state: JobState) {
        if let Err(err) = self.metadb.update_job_state(object_id, state).await {
            warn!(object_id = %object_id, state = state.as_str(), error = %err, "Failed to update job state");
        }
    }

    pub fn ask_upload_object(&self, task: &Task) -> Result<(), RefuseReason> {
        if self.queue.has(&task.key) {
            warn!(key = %task.key, "Upload object task repeated");
            return Err(RefuseReason::TaskRepeated);
        }
        let uploading = self.uploading_count();
        if uploading >= self.options.max_upload_concurrent {
            warn!(
                uploading,
                max = self.options.max_upload_concurrent,
                "Upload object exceeds parallel limit"
            );
            return Err(RefuseReason::ExceedUploadParallel);
        }
        Ok(())
    }

    pub async fn create_upload_object_task(&self, task: Task) -> SpResult<()> {
        let TaskKind::UploadObject(upload) = &task.kind else {
            return Err(SpError::InvalidParameters(format!(
                "{} is not an upload task",
                task.task_type().name()
            )));
        };
        let object_info = upload.object_info.clone();
        if let Some(old) = self.queue.pop_by_key(&task.key) {
            if !old.expired() {
                let key = old.key.clone();
                self.queue.push(old)?;
                warn!(key = %key, "Upload object task repeated");
                return Err(SpError::TaskRepeated(key));
            }
            debug!(key = %old.key, "Replacing expired upload object task");
        }
        self.queue.push(task)?;
        if let Err(err) = self.metadb.create_upload_job(&object_info).await {
            warn!(object_id = %object_info.id, error = %err, "Failed to create upload job");
        }
        info!(object_id = %object_info.id, "Created upload object task");
        Ok(())
    }

    /// Requeues a failed task with a fresh update time, or drops it once its
    /// retries are spent. Returns whether it was requeued.
    async fn retry_or_drop(&self, mut task: Task, failed: Option<(ObjectId, JobState)>) -> SpResult<bool> {
        if task.retry_exceeded() {
            self.queue.pop_by_key(&task.key);
            if let Some((object_id, state)) = failed {
                self.update_state(object_id, state).await;
            }
            error!(task = %task, "Task retries exhausted, dropped");
            return Ok(false);
        }
        task.touch();
        let description = task.to_string();
        if !self.queue.replace(task) {
            // collected or settled while it was running
            warn!(task = %description, "Failed task no longer queued, not requeued");
            return Ok(false);
        }
        warn!(task = %description, "Task failed, requeued");
        Ok(true)
    }

    pub async fn done_upload_object_task(&self, mut task: Task) -> SpResult<()> {
        let TaskKind::UploadObject(upload) = &task.kind else {
            return Err(SpError::DanglingTaskPointer);
        };
        let object_info = upload.object_info.clone();
        let storage_params = upload.storage_params;
        if task.error.is_some() {
            // upload tasks never pass through alloc_task, so count the attempt here
            task.inc_retry();
            self.retry_or_drop(task, Some((object_info.id, JobState::UploadObjectError)))
                .await?;
            return Ok(());
        }
        self.queue.pop_by_key(&task.key);
        self.update_state(object_info.id, JobState::UploadObjectDone).await;
        let replicate = self.options.task.replicate_task(object_info, storage_params);
        info!(key = %replicate.key, "Push replicate piece task");
        self.queue.push(replicate)
    }

    pub async fn done_replicate_piece_task(&self, task: Task) -> SpResult<()> {
        let TaskKind::ReplicatePiece(replicate) = &task.kind else {
            return Err(SpError::DanglingTaskPointer);
        };
        let object_id = replicate.object_info.id;
        if task.error.is_some() {
            self.retry_or_drop(task, Some((object_id, JobState::ReplicateObjectError)))
                .await?;
            return Ok(());
        }
        self.queue.pop_by_key(&task.key);
        if replicate.sealed {
            self.update_state(object_id, JobState::SealObjectDone).await;
            info!(object_id = %object_id, "Replicated and sealed object");
            return Ok(());
        }
        self.update_state(object_id, JobState::ReplicateObjectDone).await;
        let seal = self.options.task.seal_task(
            replicate.object_info.clone(),
            replicate.storage_params,
            replicate.secondary_addresses.clone(),
            replicate.secondary_signatures.clone(),
        );
        info!(key = %seal.key, "Push seal object task");
        self.queue.push(seal)
    }

    pub async fn done_seal_object_task(&self, task: Task) -> SpResult<()> {
        let TaskKind::SealObject(seal) = &task.kind else {
            return Err(SpError::DanglingTaskPointer);
        };
        let object_id = seal.object_info.id;
        if task.error.is_some() {
            self.retry_or_drop(task, Some((object_id, JobState::SealObjectError)))
                .await?;
            return Ok(());
        }
        self.queue.pop_by_key(&task.key);
        self.update_state(object_id, JobState::SealObjectDone).await;
        info!(object_id = %object_id, "Sealed object");
        Ok(())
    }

    pub async fn done_gc_object_task(&self, task: Task) -> SpResult<()> {
        if !matches!(task.kind, TaskKind::GcObject(_)) {
            return Err(SpError::DanglingTaskPointer);
        }
        if task.error.is_some() {
            self.retry_or_drop(task, None).await?;
            return Ok(());
        }
        self.queue.pop_by_key(&task.key);
        info!(key = %task.key, "Succeed to run gc object");
        Ok(())
    }

    /// Hands out the best task `limit` can afford. The task stays queued with
    /// one more retry counted until a `done_*` call settles it.
    pub fn alloc_task(&self, limit: &ResourceLimit) -> Option<Task> {
        self.alloc_task_with(limit, |_| Ok(()))
    }

    /// Like `alloc_task`, but the task is dispatched only if `reserve` succeeds.
    /// A refused task goes back untouched, with no retry spent.
    pub fn alloc_task_with(
        &self,
        limit: &ResourceLimit,
        reserve: impl FnOnce(&Task) -> SpResult<()>,
    ) -> Option<Task> {
        let task = self.queue.pop_by_limit(limit)?;
        if let Err(err) = reserve(&task) {
            debug!(task = %task, error = %err, "Task reservation refused, returned to queue");
            if let Err(err) = self.queue.pop_push(task) {
                error!(error = %err, "Failed to return refused task");
            }
            return None;
        }
        let mut task = task;
        task.inc_retry();
        task.touch();
        if let Err(err) = self.queue.pop_push(task.clone()) {
            error!(key = %task.key, error = %err, "Failed to requeue dispatched task");
            return None;
        }
        debug!(task = %task, "Dispatched task");
        Some(task)
    }

    /// Records gc progress. Returns `true` when the task is gone and the
    /// executor should stop working on it.
    pub fn report_gc_object_progress(&self, task: &Task) -> bool {
        let Some(mut queued) = self.queue.get(&task.key) else {
            warn!(key = %task.key, "Gc object task canceled");
            return true;
        };
        if !progress_in_order(&queued, task) {
            debug!(key = %task.key, "Ignoring out of order gc progress");
            return false;
        }
        if let (TaskKind::GcObject(q), TaskKind::GcObject(t)) = (&mut queued.kind, &task.kind) {
            q.current_block = t.current_block;
            q.last_deleted_object_id = t.last_deleted_object_id;
        }
        queued.touch();
        if !self.queue.replace(queued) {
            warn!(key = %task.key, "Gc object task canceled");
            return true;
        }
        false
    }

    pub async fn refresh_height(&self) -> SpResult<u64> {
        let height = self.chain.current_height().await?;
        self.height.store(height, Ordering::Release);
        Ok(height)
    }

    /// Runs every sub-queue's collection against a fresh chain height.
    pub async fn collect(&self) {
        if let Err(err) = self.refresh_height().await {
            warn!(error = %err, "Failed to query current chain height");
        }
        if let Some(handle) = self.queue.run_collection() {
            if let Err(err) = handle.await {
                error!(error = %err, "Queue collection panicked");
            }
        }
        let dropped = std::mem::take(&mut *self.dropped.lock().unwrap_or_else(|e| e.into_inner()));
        for task in dropped {
            if let Some((object_id, state)) = failed_state(&task) {
                self.update_state(object_id, state).await;
            }
        }
    }

    pub async fn refresh_storage_params(&self) -> SpResult<()> {
        let params = self.chain.storage_params().await?;
        self.metadb.set_storage_params(&params).await?;
        debug!(params = ?params, "Refreshed storage params");
        Ok(())
    }

    pub async fn refresh_sp_info(&self) -> SpResult<()> {
        let sps = self.chain.sp_list().await?;
        self.metadb.update_all_sp(&sps).await?;
        if let Some(peers) = &self.peers {
            let addresses: Vec<String> = sps.iter().map(|sp| sp.operator_address.to_lowercase()).collect();
            peers.update_sp(&addresses);
        }
        debug!(sps = sps.len(), "Refreshed sp info");
        Ok(())
    }

    /// Timer loop: queue collection and chain refreshes until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let timers = &self.options.timers;
        let mut gc = tokio::time::interval(Duration::from_secs(timers.gc_interval_seconds.max(1)));
        let mut params = tokio::time::interval(Duration::from_secs(timers.refresh_storage_params_seconds.max(1)));
        let mut sps = tokio::time::interval(Duration::from_secs(timers.refresh_sp_info_seconds.max(1)));
        info!("Manager started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Manager stopping");
                    break;
                }
                _ = params.tick() => {
                    if let Err(err) = self.refresh_storage_params().await {
                        warn!(error = %err, "Failed to refresh storage params");
                    }
                }
                _ = sps.tick() => {
                    if let Err(err) = self.refresh_sp_info().await {
                        warn!(error = %err, "Failed to refresh sp info");
                    }
                }
                _ = gc.tick() => self.collect().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devchain::{DevChain, DevChainConfig};
    use crate::metadb::SledMetadataDb;
    use strata_protocol::{ObjectInfo, StorageParams, StorageProvider};

    fn manager(options: ManagerOptions, height: u64) -> (Manager, Arc<DevChain>, Arc<SledMetadataDb>) {
        let db = sled::Config::new().temporary(true).open().expect("db");
        let metadb = Arc::new(SledMetadataDb::open(&db).expect("metadb"));
        let chain = Arc::new(DevChain::new(DevChainConfig {
            start_height: height,
            block_time_ms: 0,
            ..Default::default()
        }));
        (Manager::new(options, metadb.clone(), chain.clone()), chain, metadb)
    }

    fn object(id: u64) -> ObjectInfo {
        ObjectInfo {
            id: ObjectId::from(id),
            bucket_name: "bucket".into(),
            object_name: format!("object-{id}"),
            payload_size: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upload_flows_into_replicate_then_seal() {
        let (m, _, metadb) = manager(ManagerOptions::default(), 100);
        let cfg = m.task_config().clone();
        let upload = cfg.upload_task(object(1), StorageParams::default());
        m.ask_upload_object(&upload).expect("admitted");
        m.create_upload_object_task(upload.clone()).await.expect("create");
        assert_eq!(m.ask_upload_object(&upload), Err(RefuseReason::TaskRepeated));

        m.done_upload_object_task(upload).await.expect("done upload");
        let replicate = m.alloc_task(&ResourceLimit::infinite()).expect("replicate task");
        assert_eq!(replicate.task_type(), TaskType::ReplicatePiece);
        assert_eq!(replicate.retry, 1);

        m.done_replicate_piece_task(replicate).await.expect("done replicate");
        let seal = m.alloc_task(&ResourceLimit::infinite()).expect("seal task");
        assert_eq!(seal.task_type(), TaskType::SealObject);
        m.done_seal_object_task(seal).await.expect("done seal");

        assert_eq!(m.uploading_count(), 0);
        let job = metadb.get_job(ObjectId::from(1)).await.expect("job");
        assert_eq!(job.state, JobState::SealObjectDone);
    }

    #[tokio::test]
    async fn admission_counts_the_whole_pipeline() {
        let options = ManagerOptions {
            max_upload_concurrent: 2,
            ..ManagerOptions::default()
        };
        let (m, _, _) = manager(options, 100);
        let cfg = m.task_config().clone();
        let first = cfg.upload_task(object(11), StorageParams::default());
        m.create_upload_object_task(first).await.expect("first");
        m.queue()
            .push(cfg.replicate_task(object(12), StorageParams::default()))
            .expect("replicate");
        let third = cfg.upload_task(object(13), StorageParams::default());
        assert_eq!(m.ask_upload_object(&third), Err(RefuseReason::ExceedUploadParallel));
        assert_eq!(RefuseReason::ExceedUploadParallel.to_string(), "exceed_upload_parallel");

        m.queue().pop_by_key(&ObjectId::from(12).to_string());
        assert_eq!(m.ask_upload_object(&third), Ok(()));
    }

    #[tokio::test]
    async fn sealed_replicate_task_finishes_without_seal_task() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        let mut task = m.task_config().replicate_task(object(2), StorageParams::default());
        m.queue().push(task.clone()).expect("push");
        if let TaskKind::ReplicatePiece(r) = &mut task.kind {
            r.sealed = true;
        }
        m.done_replicate_piece_task(task).await.expect("done");
        assert!(m.queue().is_empty());
    }

    #[tokio::test]
    async fn failure_requeues_until_retries_run_out() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        let task = m.task_config().seal_task(object(3), StorageParams::default(), vec![], vec![]);
        let limit = task.retry_limit;
        m.queue().push(task).expect("push");
        for round in 1..=limit + 1 {
            // make the task eligible again for pickup
            let key = ObjectId::from(3).to_string();
            let mut queued = m.queue().get(&key).expect("queued");
            queued.update_time -= queued.timeout + 1;
            m.queue().pop_push(queued).expect("pop push");

            let mut task = m.alloc_task(&ResourceLimit::infinite()).expect("alloc");
            assert_eq!(task.retry, round);
            task.set_error("chain unavailable");
            m.done_seal_object_task(task).await.expect("done");
        }
        assert!(m.queue().is_empty());
    }

    #[tokio::test]
    async fn alloc_respects_the_budget() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        m.queue()
            .push(m.task_config().replicate_task(object(4), StorageParams::default()))
            .expect("push");
        let mut tight = ResourceLimit::infinite();
        tight.memory = 1024;
        assert!(m.alloc_task(&tight).is_none());
        assert!(m.alloc_task(&ResourceLimit::infinite()).is_some());
        // dispatched once; not handed out again until it times out
        assert!(m.alloc_task(&ResourceLimit::infinite()).is_none());
    }

    #[tokio::test]
    async fn refused_reservation_spends_no_retry() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        let task = m.task_config().replicate_task(object(5), StorageParams::default());
        m.queue().push(task.clone()).expect("push");

        let refused = m.alloc_task_with(&ResourceLimit::infinite(), |_| {
            Err(SpError::ResourceLimitExceeded {
                scope: "executor".into(),
                resource: "high tasks",
                current: 1,
                attempted: 1,
                limit: 1,
            })
        });
        assert!(refused.is_none());
        let queued = m.queue().get(&task.key).expect("still queued");
        assert_eq!(queued.retry, 0);

        let dispatched = m.alloc_task_with(&ResourceLimit::infinite(), |_| Ok(())).expect("dispatched");
        assert_eq!(dispatched.retry, 1);
    }

    #[tokio::test]
    async fn collected_tasks_leave_error_states() {
        let (m, _, metadb) = manager(ManagerOptions::default(), 100);
        let cfg = m.task_config().clone();
        for (id, mut task) in [
            (6, cfg.replicate_task(object(6), StorageParams::default())),
            (7, cfg.seal_task(object(7), StorageParams::default(), vec![], vec![])),
        ] {
            metadb.create_upload_job(&object(id)).await.expect("job");
            task.retry = task.retry_limit + 1;
            task.update_time -= task.timeout + 1;
            m.queue().push(task).expect("push");
        }
        let mut live = cfg.replicate_task(object(8), StorageParams::default());
        live.retry = 1;
        metadb.create_upload_job(&object(8)).await.expect("job");
        m.queue().push(live).expect("push");

        m.collect().await;

        assert_eq!(
            metadb.get_job(ObjectId::from(6)).await.expect("job").state,
            JobState::ReplicateObjectError
        );
        assert_eq!(
            metadb.get_job(ObjectId::from(7)).await.expect("job").state,
            JobState::SealObjectError
        );
        assert_ne!(
            metadb.get_job(ObjectId::from(8)).await.expect("job").state,
            JobState::ReplicateObjectError
        );
        assert_eq!(m.queue().len(), 1);
        assert!(m.queue().has(&ObjectId::from(8).to_string()));
    }

    #[tokio::test]
    async fn failed_task_removed_while_running_stays_gone() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        let task = m.task_config().seal_task(object(9), StorageParams::default(), vec![], vec![]);
        m.queue().push(task).expect("push");
        let mut running = m.alloc_task(&ResourceLimit::infinite()).expect("alloc");

        m.queue().pop_by_key(&running.key);
        running.set_error("chain unavailable");
        m.done_seal_object_task(running).await.expect("done");
        assert!(m.queue().is_empty());
    }

    #[tokio::test]
    async fn gc_windows_follow_the_chain() {
        let mut options = ManagerOptions::default();
        options.gc.frontier = 5000;
        let (m, chain, _) = manager(options, 10_000);
        m.collect().await;
        let mut windows = Vec::new();
        while let Some(task) = m.queue().pop() {
            if let TaskKind::GcObject(gc) = task.kind {
                windows.push((gc.start_block, gc.end_block));
            }
        }
        windows.sort();
        assert_eq!(windows, vec![(5001, 6000), (6001, 7000), (7001, 8000)]);
        assert_eq!(m.gc_frontier(), 8000);

        chain.advance(1000);
        m.collect().await;
        assert_eq!(m.gc_frontier(), 9000);
    }

    #[tokio::test]
    async fn gc_progress_ignores_regressions_and_cancels_missing() {
        let (m, _, _) = manager(ManagerOptions::default(), 100);
        let task = m.task_config().gc_object_task(1, 1000);
        m.queue().push(task.clone()).expect("push");

        let mut ahead = task.clone();
        if let TaskKind::GcObject(gc) = &mut ahead.kind {
            gc.current_block = 500;
            gc.last_deleted_object_id = ObjectId::from(9);
        }
        assert!(!m.report_gc_object_progress(&ahead));

        let mut behind = task.clone();
        if let TaskKind::GcObject(gc) = &mut behind.kind {
            gc.current_block = 300;
        }
        assert!(!m.report_gc_object_progress(&behind));
        match m.queue().get(&task.key).expect("queued").kind {
            TaskKind::GcObject(gc) => assert_eq!(gc.current_block, 500),
            other => panic!("unexpected {other:?}"),
        }

        m.done_gc_object_task(task.clone()).await.expect("done");
        assert!(m.report_gc_object_progress(&ahead));
    }

    #[tokio::test]
    async fn refresh_writes_chain_state_and_peer_groups() {
        let (m, chain, metadb) = manager(ManagerOptions::default(), 100);
        let peers = Arc::new(PeerDirectory::new());
        let m = m.with_peers(peers.clone());
        chain.set_storage_providers(vec![StorageProvider {
            operator_address: "0xAB".into(),
            approval_address: "0xcd".into(),
            endpoint: "peer".into(),
            ..Default::default()
        }]);
        m.refresh_storage_params().await.expect("params");
        m.refresh_sp_info().await.expect("sps");
        assert_eq!(metadb.get_storage_params().await.expect("params"), StorageParams::default());
        assert_eq!(metadb.get_sp_by_address("0xab").await.expect("sp").endpoint, "peer");
        assert!(peers.check_sp("0xab"));
    }
}
