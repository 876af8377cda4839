use super::{pickup_by_priority, PickupFn, TaskQueue};
use crate::error::{SpError, SpResult};
use crate::rcmgr::ResourceLimit;
use crate::task::Task;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fixed set of sub-queues keyed by task priority.
pub struct PriorityQueue {
    name: String,
    queues: BTreeMap<u8, Arc<TaskQueue>>,
    pickup: PickupFn,
    /// Serializes multi-queue operations such as `pop_by_limit`.
    lock: Mutex<()>,
    collecting: Arc<AtomicBool>,
}

impl PriorityQueue {
    pub fn new(name: impl Into<String>, queues: BTreeMap<u8, Arc<TaskQueue>>) -> Self {
        Self {
            name: name.into(),
            queues,
            pickup: Arc::new(pickup_by_priority),
            lock: Mutex::new(()),
            collecting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_pickup(mut self, pickup: PickupFn) -> Self {
        self.pickup = pickup;
        self
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue_for(&self, priority: u8) -> SpResult<&Arc<TaskQueue>> {
        self.queues.get(&priority).ok_or_else(|| {
            warn!(queue = %self.name, priority, "Task priority unsupported");
            SpError::UnsupportedTaskPriority(priority)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priorities(&self) -> Vec<u8> {
        self.queues.keys().copied().collect()
    }

    pub fn sub_queue(&self, priority: u8) -> Option<&Arc<TaskQueue>> {
        self.queues.get(&priority)
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.queues.values().map(|q| q.cap()).sum()
    }

    pub fn sub_queue_len(&self, priority: u8) -> usize {
        self.queues.get(&priority).map_or(0, |q| q.len())
    }

    fn max_non_empty(&self) -> Option<&Arc<TaskQueue>> {
        self.queues.values().rev().find(|q| !q.is_empty())
    }

    /// Most recent task of the highest non-empty priority.
    pub fn top(&self) -> Option<Task> {
        let _g = self.guard();
        self.max_non_empty().and_then(|q| q.top())
    }

    pub fn pop(&self) -> Option<Task> {
        let _g = self.guard();
        self.max_non_empty().and_then(|q| q.pop())
    }

    pub fn push(&self, task: Task) -> SpResult<()> {
        let _g = self.guard();
        self.queue_for(task.priority)?.push(task)
    }

    pub fn pop_push(&self, task: Task) -> SpResult<()> {
        let _g = self.guard();
        self.queue_for(task.priority)?.pop_push(task);
        Ok(())
    }

    /// Updates a task that is still queued. Returns `false` when it has been
    /// removed in the meantime.
    pub fn replace(&self, task: Task) -> bool {
        let _g = self.guard();
        self.queues
            .get(&task.priority)
            .is_some_and(|q| q.replace(task))
    }

    pub fn pop_by_key(&self, key: &str) -> Option<Task> {
        let _g = self.guard();
        self.queues.values().find_map(|q| q.pop_by_key(key))
    }

    pub fn has(&self, key: &str) -> bool {
        self.queues.values().any(|q| q.has(key))
    }

    pub fn get(&self, key: &str) -> Option<Task> {
        self.queues.values().find_map(|q| q.get(key))
    }

    pub fn expired(&self, key: &str) -> bool {
        self.queues.values().any(|q| q.expired(key))
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.queues.values().any(|q| q.is_active(key))
    }

    /// Takes one fitting candidate from every limit-aware sub-queue, picks one of
    /// them and puts the rest back.
    pub fn pop_by_limit(&self, limit: &ResourceLimit) -> Option<Task> {
        let _g = self.guard();
        let mut candidates: Vec<Task> = self
            .queues
            .values()
            .filter(|q| q.support_limit())
            .filter_map(|q| q.pop_by_limit(limit))
            .collect();
        let chosen = {
            let refs: Vec<&Task> = candidates.iter().collect();
            (self.pickup)(&refs)
        }?;
        let task = candidates.swap_remove(chosen);
        for other in candidates {
            if let Some(queue) = self.queues.get(&other.priority) {
                if let Err(e) = queue.push(other) {
                    warn!(queue = %self.name, error = %e, "Failed to return candidate");
                }
            }
        }
        debug!(queue = %self.name, key = %task.key, priority = task.priority, "Picked task");
        Some(task)
    }

    /// Runs every sub-queue's collection on a blocking thread. Returns `None` when a
    /// collection is already in progress.
    pub fn run_collection(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.collecting.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, "Collection already running");
            return None;
        }
        let this = self.clone();
        Some(tokio::task::spawn_blocking(move || {
            let _reset = CollectingFlag(this.collecting.clone());
            for queue in this.queues.values() {
                queue.run_collection();
            }
        }))
    }
}

/// Clears the gc-running flag even when a collection panics.
struct CollectingFlag(Arc<AtomicBool>);

impl Drop for CollectingFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueState, Strategy};
    use crate::task::TaskConfig;
    use strata_protocol::{ObjectId, ObjectInfo, StorageParams};

    fn object(id: u64) -> ObjectInfo {
        ObjectInfo {
            id: ObjectId::from(id),
            ..Default::default()
        }
    }

    fn build() -> Arc<PriorityQueue> {
        let mut queues = BTreeMap::new();
        queues.insert(
            0,
            Arc::new(TaskQueue::new("upload", 10, Strategy::timeout_policy(), false)),
        );
        queues.insert(
            170,
            Arc::new(TaskQueue::new("replicate", 10, Strategy::retry_policy(), true)),
        );
        queues.insert(
            255,
            Arc::new(TaskQueue::new("seal", 10, Strategy::retry_policy(), true)),
        );
        Arc::new(PriorityQueue::new("manager", queues))
    }

    #[test]
    fn push_routes_by_priority() {
        let pq = build();
        let cfg = TaskConfig::default();
        pq.push(cfg.upload_task(object(1), StorageParams::default()))
            .expect("upload");
        pq.push(cfg.replicate_task(object(2), StorageParams::default()))
            .expect("replicate");
        assert_eq!(pq.sub_queue_len(0), 1);
        assert_eq!(pq.sub_queue_len(170), 1);
        assert_eq!(pq.len(), 2);
        assert_eq!(pq.priorities(), vec![0, 170, 255]);

        let mut odd = cfg.gc_object_task(1, 10);
        odd.priority = 7;
        assert_eq!(pq.push(odd), Err(SpError::UnsupportedTaskPriority(7)));
        assert_eq!(pq.top().map(|t| t.key), Some("2".to_string()));
    }

    #[test]
    fn pop_by_limit_returns_unpicked_candidates() {
        let pq = build();
        let cfg = TaskConfig::default();
        pq.push(cfg.upload_task(object(1), StorageParams::default()))
            .expect("upload");
        pq.push(cfg.replicate_task(object(2), StorageParams::default()))
            .expect("replicate");
        pq.push(cfg.seal_task(object(3), StorageParams::default(), vec![], vec![]))
            .expect("seal");

        let first = pq
            .pop_by_limit(&ResourceLimit::infinite())
            .expect("a task");
        assert_ne!(first.key, "1", "upload queue does not hand out by limit");
        assert_eq!(pq.len(), 2);
        let second = pq
            .pop_by_limit(&ResourceLimit::infinite())
            .expect("another task");
        assert_ne!(first.key, second.key);
        assert!(pq.pop_by_limit(&ResourceLimit::infinite()).is_none());
        assert!(pq.has("1"));
    }

    #[test]
    fn pop_by_limit_skips_tasks_over_budget() {
        let pq = build();
        let cfg = TaskConfig::default();
        pq.push(cfg.replicate_task(object(2), StorageParams::default()))
            .expect("replicate");
        pq.push(cfg.seal_task(object(3), StorageParams::default(), vec![], vec![]))
            .expect("seal");
        let no_memory = ResourceLimit {
            memory: 0,
            ..ResourceLimit::infinite()
        };
        let task = pq.pop_by_limit(&no_memory).expect("seal fits");
        assert_eq!(task.key, "3");
        assert!(pq.has("2"));
    }

    #[tokio::test]
    async fn collection_runs_once_at_a_time() {
        let pq = build();
        let cfg = TaskConfig::default();
        let mut stale = cfg.upload_task(object(1), StorageParams::default());
        stale.update_time -= 1000;
        pq.push(stale).expect("upload");

        let handle = pq.run_collection().expect("first run");
        handle.await.expect("join");
        assert!(!pq.has("1"));
        let again = pq.run_collection().expect("flag was reset");
        again.await.expect("join");
    }

    #[tokio::test]
    async fn panicking_collection_does_not_block_the_next_run() {
        let pq = build();
        let seal = pq.sub_queue(255).expect("seal queue");
        seal.set_strategy(Strategy::default().with_collection(Arc::new(|_: &mut QueueState| {
            panic!("collection failed");
        })));
        let handle = pq.run_collection().expect("first run");
        assert!(handle.await.is_err());

        seal.set_strategy(Strategy::retry_policy());
        let again = pq.run_collection().expect("flag was reset");
        again.await.expect("join");
    }

    #[test]
    fn replace_skips_removed_tasks() {
        let pq = build();
        let cfg = TaskConfig::default();
        let mut task = cfg.replicate_task(object(2), StorageParams::default());
        pq.push(task.clone()).expect("replicate");
        task.retry = 1;
        assert!(pq.replace(task.clone()));
        assert_eq!(pq.get("2").map(|t| t.retry), Some(1));
        pq.pop_by_key("2");
        assert!(!pq.replace(task));
        assert!(!pq.has("2"));
    }
}
