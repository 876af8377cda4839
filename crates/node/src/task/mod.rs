//! Task model shared by the manager, the queues and the executors. Every task carries
//! the same header (times, retry bookkeeping, priority) and a kind-specific payload.

mod priority;

pub use priority::{
    TaskPriorities, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, UNSCHEDULED_PRIORITY,
};

use crate::rcmgr::{ResourceLimit, ScopeStat, TaskLevel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use strata_protocol::{ObjectId, ObjectInfo, StorageParams};

pub type TaskKey = String;

pub const DEFAULT_REPLICATE_MEMORY_LIMIT: i64 = 40 * 1024 * 1024;

static REPLICATE_MEMORY_LIMIT: AtomicI64 = AtomicI64::new(DEFAULT_REPLICATE_MEMORY_LIMIT);

/// Memory a replicate task is expected to need; feeds its limit estimate.
pub fn set_replicate_memory_limit(bytes: i64) {
    REPLICATE_MEMORY_LIMIT.store(bytes.max(0), Ordering::Relaxed);
}

pub fn replicate_memory_limit() -> i64 {
    REPLICATE_MEMORY_LIMIT.load(Ordering::Relaxed)
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    UploadObject,
    ReplicatePiece,
    SealObject,
    ReceivePiece,
    DownloadObject,
    GcObject,
    GcZombiePiece,
    GcStore,
}

impl TaskType {
    pub fn name(&self) -> &'static str {
        match self {
            TaskType::UploadObject => "UploadObjectTask",
            TaskType::ReplicatePiece => "ReplicatePieceTask",
            TaskType::SealObject => "SealObjectTask",
            TaskType::ReceivePiece => "ReceivePieceTask",
            TaskType::DownloadObject => "DownloadObjectTask",
            TaskType::GcObject => "GCObjectTask",
            TaskType::GcZombiePiece => "GCZombiePieceTask",
            TaskType::GcStore => "GCStoreTask",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTask {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateTask {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    /// Set once the replicator has sealed the object itself.
    pub sealed: bool,
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealTask {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTask {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub replicate_idx: u32,
    /// -1 when the task covers every segment of the index.
    pub segment_idx: i32,
    pub piece_size: u64,
    pub piece_checksum: Vec<u8>,
    pub integrity_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub low: u64,
    pub high: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcObjectTask {
    pub start_block: u64,
    pub end_block: u64,
    pub current_block: u64,
    pub last_deleted_object_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcZombieTask {
    pub start_object_id: u64,
    pub end_object_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStoreTask {
    pub current_idx: u64,
    pub delete_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    UploadObject(ObjectTask),
    ReplicatePiece(ReplicateTask),
    SealObject(SealTask),
    ReceivePiece(ReceiveTask),
    DownloadObject(DownloadTask),
    GcObject(GcObjectTask),
    GcZombiePiece(GcZombieTask),
    GcStore(GcStoreTask),
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::UploadObject(_) => TaskType::UploadObject,
            TaskKind::ReplicatePiece(_) => TaskType::ReplicatePiece,
            TaskKind::SealObject(_) => TaskType::SealObject,
            TaskKind::ReceivePiece(_) => TaskType::ReceivePiece,
            TaskKind::DownloadObject(_) => TaskType::DownloadObject,
            TaskKind::GcObject(_) => TaskType::GcObject,
            TaskKind::GcZombiePiece(_) => TaskType::GcZombiePiece,
            TaskKind::GcStore(_) => TaskType::GcStore,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub kind: TaskKind,
    pub create_time: i64,
    pub update_time: i64,
    /// Seconds.
    pub timeout: i64,
    pub priority: u8,
    pub retry: i64,
    pub retry_limit: i64,
    pub error: Option<String>,
}

fn task_key(kind: &TaskKind, create_time: i64) -> TaskKey {
    match kind {
        TaskKind::UploadObject(t) => t.object_info.id.to_string(),
        TaskKind::ReplicatePiece(t) => t.object_info.id.to_string(),
        TaskKind::SealObject(t) => t.object_info.id.to_string(),
        TaskKind::ReceivePiece(t) => format!(
            "Receive-{}-{}-{}",
            t.object_info.id, t.replicate_idx, t.segment_idx
        ),
        TaskKind::DownloadObject(t) => {
            format!("Download-{}-{}-{}", t.object_info.id, t.low, t.high)
        }
        TaskKind::GcObject(t) => {
            format!("GCObject-{create_time}-{}-{}", t.start_block, t.end_block)
        }
        TaskKind::GcZombiePiece(t) => {
            format!("GCZombie-{}-{}", t.start_object_id, t.end_object_id)
        }
        TaskKind::GcStore(_) => format!("GCStore-{create_time}"),
    }
}

impl Task {
    /// A fresh task: create and update time now, priority from the global map.
    pub fn new(kind: TaskKind, timeout: i64, retry_limit: i64) -> Self {
        let now = now_secs();
        let priority = TaskPriorities::global().priority(kind.task_type());
        Self {
            key: task_key(&kind, now),
            kind,
            create_time: now,
            update_time: now,
            timeout,
            priority,
            retry: 0,
            retry_limit,
            error: None,
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn expired(&self) -> bool {
        self.expired_at(now_secs())
    }

    pub fn expired_at(&self, now: i64) -> bool {
        self.update_time.saturating_add(self.timeout) < now
    }

    pub fn retry_exceeded(&self) -> bool {
        self.retry > self.retry_limit
    }

    /// Retries used up and timed out: nothing will pick the task again.
    pub fn active(&self) -> bool {
        self.retry_exceeded() && self.expired()
    }

    pub fn inc_retry(&mut self) {
        self.retry += 1;
    }

    pub fn touch(&mut self) {
        self.update_time = now_secs();
    }

    pub fn set_error(&mut self, err: impl ToString) {
        self.error = Some(err.to_string());
    }

    pub fn level(&self) -> TaskLevel {
        TaskPriorities::global().level(self.priority)
    }

    /// Resources the task is expected to hold while it runs.
    pub fn limit_estimate(&self) -> ResourceLimit {
        let mut limit = ResourceLimit::zero();
        let counts_as_task = match self.task_type() {
            TaskType::ReplicatePiece => {
                limit.memory = replicate_memory_limit();
                true
            }
            TaskType::SealObject
            | TaskType::GcObject
            | TaskType::GcZombiePiece
            | TaskType::GcStore => true,
            TaskType::UploadObject | TaskType::DownloadObject | TaskType::ReceivePiece => false,
        };
        if counts_as_task {
            limit.tasks = 1;
            match self.level() {
                TaskLevel::High => limit.tasks_high = 1,
                TaskLevel::Medium => limit.tasks_medium = 1,
                TaskLevel::Low => limit.tasks_low = 1,
            }
        }
        limit
    }

    pub fn estimate_stat(&self) -> ScopeStat {
        self.limit_estimate().as_stat()
    }

    pub fn object_info(&self) -> Option<&ObjectInfo> {
        match &self.kind {
            TaskKind::UploadObject(t) => Some(&t.object_info),
            TaskKind::ReplicatePiece(t) => Some(&t.object_info),
            TaskKind::SealObject(t) => Some(&t.object_info),
            TaskKind::ReceivePiece(t) => Some(&t.object_info),
            TaskKind::DownloadObject(t) => Some(&t.object_info),
            _ => None,
        }
    }

    pub fn storage_params(&self) -> Option<&StorageParams> {
        match &self.kind {
            TaskKind::UploadObject(t) => Some(&t.storage_params),
            TaskKind::ReplicatePiece(t) => Some(&t.storage_params),
            TaskKind::SealObject(t) => Some(&t.storage_params),
            TaskKind::ReceivePiece(t) => Some(&t.storage_params),
            TaskKind::DownloadObject(t) => Some(&t.storage_params),
            _ => None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key[{}], type[{}], priority[{}], retry[{}/{}], create[{}], update[{}], timeout[{}]",
            self.key,
            self.task_type().name(),
            self.priority,
            self.retry,
            self.retry_limit,
            self.create_time,
            self.update_time,
            self.timeout
        )?;
        if let Some(err) = &self.error {
            write!(f, ", error[{err}]")?;
        }
        Ok(())
    }
}

/// Timeouts and retry limits used when tasks are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Throughput assumed when deriving transfer timeouts from payload size.
    pub speed_bytes_per_sec: u64,
    pub min_upload_timeout_secs: i64,
    pub max_upload_timeout_secs: i64,
    pub min_replicate_timeout_secs: i64,
    pub max_replicate_timeout_secs: i64,
    pub seal_timeout_secs: i64,
    pub gc_timeout_secs: i64,
    pub upload_retry_limit: i64,
    pub replicate_retry_limit: i64,
    pub receive_retry_limit: i64,
    pub seal_retry_limit: i64,
    pub gc_retry_limit: i64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            speed_bytes_per_sec: 10 * 1024 * 1024,
            min_upload_timeout_secs: 2,
            max_upload_timeout_secs: 10,
            min_replicate_timeout_secs: 90,
            max_replicate_timeout_secs: 500,
            seal_timeout_secs: 20,
            gc_timeout_secs: 60,
            upload_retry_limit: 3,
            replicate_retry_limit: 3,
            receive_retry_limit: 3,
            seal_retry_limit: 10,
            gc_retry_limit: 3,
        }
    }
}

impl TaskConfig {
    fn transfer_secs(&self, payload_size: u64) -> i64 {
        let speed = self.speed_bytes_per_sec.max(1);
        i64::try_from(payload_size / speed).unwrap_or(i64::MAX)
    }

    pub fn upload_timeout(&self, payload_size: u64) -> i64 {
        self.transfer_secs(payload_size)
            .clamp(self.min_upload_timeout_secs, self.max_upload_timeout_secs)
    }

    pub fn replicate_timeout(&self, payload_size: u64) -> i64 {
        self.transfer_secs(payload_size)
            .saturating_mul(3)
            .clamp(self.min_replicate_timeout_secs, self.max_replicate_timeout_secs)
    }

    pub fn upload_task(&self, object_info: ObjectInfo, storage_params: StorageParams) -> Task {
        let timeout = self.upload_timeout(object_info.payload_size);
        Task::new(
            TaskKind::UploadObject(ObjectTask {
                object_info,
                storage_params,
            }),
            timeout,
            self.upload_retry_limit,
        )
    }

    pub fn replicate_task(&self, object_info: ObjectInfo, storage_params: StorageParams) -> Task {
        let timeout = self.replicate_timeout(object_info.payload_size);
        Task::new(
            TaskKind::ReplicatePiece(ReplicateTask {
                object_info,
                storage_params,
                sealed: false,
                secondary_addresses: Vec::new(),
                secondary_signatures: Vec::new(),
            }),
            timeout,
            self.replicate_retry_limit,
        )
    }

    pub fn seal_task(
        &self,
        object_info: ObjectInfo,
        storage_params: StorageParams,
        secondary_addresses: Vec<String>,
        secondary_signatures: Vec<Vec<u8>>,
    ) -> Task {
        Task::new(
            TaskKind::SealObject(SealTask {
                object_info,
                storage_params,
                secondary_addresses,
                secondary_signatures,
            }),
            self.seal_timeout_secs,
            self.seal_retry_limit,
        )
    }

    pub fn receive_task(
        &self,
        object_info: ObjectInfo,
        storage_params: StorageParams,
        replicate_idx: u32,
        segment_idx: i32,
        piece_size: u64,
    ) -> Task {
        let timeout = self.replicate_timeout(object_info.payload_size);
        Task::new(
            TaskKind::ReceivePiece(ReceiveTask {
                object_info,
                storage_params,
                replicate_idx,
                segment_idx,
                piece_size,
                piece_checksum: Vec::new(),
                integrity_hash: Vec::new(),
                signature: Vec::new(),
            }),
            timeout,
            self.receive_retry_limit,
        )
    }

    pub fn download_task(
        &self,
        object_info: ObjectInfo,
        storage_params: StorageParams,
        low: u64,
        high: u64,
    ) -> Task {
        let timeout = self.upload_timeout(high.saturating_sub(low).saturating_add(1));
        Task::new(
            TaskKind::DownloadObject(DownloadTask {
                object_info,
                storage_params,
                low,
                high,
            }),
            timeout,
            self.upload_retry_limit,
        )
    }

    pub fn gc_object_task(&self, start_block: u64, end_block: u64) -> Task {
        Task::new(
            TaskKind::GcObject(GcObjectTask {
                start_block,
                end_block,
                current_block: start_block,
                last_deleted_object_id: ObjectId::default(),
            }),
            self.gc_timeout_secs,
            self.gc_retry_limit,
        )
    }

    pub fn gc_zombie_task(&self, start_object_id: u64, end_object_id: u64) -> Task {
        Task::new(
            TaskKind::GcZombiePiece(GcZombieTask {
                start_object_id,
                end_object_id,
            }),
            self.gc_timeout_secs,
            self.gc_retry_limit,
        )
    }

    pub fn gc_store_task(&self) -> Task {
        Task::new(
            TaskKind::GcStore(GcStoreTask {
                current_idx: 0,
                delete_count: 0,
            }),
            self.gc_timeout_secs,
            self.gc_retry_limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(id: u64, payload_size: u64) -> ObjectInfo {
        ObjectInfo {
            id: ObjectId::from(id),
            payload_size,
            ..Default::default()
        }
    }

    #[test]
    fn timeouts_clamp_to_bounds() {
        let cfg = TaskConfig::default();
        let mib = 1024 * 1024;
        assert_eq!(cfg.upload_timeout(0), 2);
        assert_eq!(cfg.upload_timeout(50 * mib), 5);
        assert_eq!(cfg.upload_timeout(500 * mib), 10);
        assert_eq!(cfg.replicate_timeout(0), 90);
        assert_eq!(cfg.replicate_timeout(100 * mib), 90);
        assert_eq!(cfg.replicate_timeout(1000 * mib), 300);
        assert_eq!(cfg.replicate_timeout(10_000 * mib), 500);
    }

    #[test]
    fn keys_per_kind() {
        let cfg = TaskConfig::default();
        let upload = cfg.upload_task(object(42, 10), StorageParams::default());
        assert_eq!(upload.key, "42");
        let receive = cfg.receive_task(object(42, 10), StorageParams::default(), 3, 1, 7);
        assert_eq!(receive.key, "Receive-42-3-1");
        let download = cfg.download_task(object(42, 10), StorageParams::default(), 0, 9);
        assert_eq!(download.key, "Download-42-0-9");
        let gc = cfg.gc_object_task(1, 1000);
        assert_eq!(gc.key, format!("GCObject-{}-1-1000", gc.create_time));
        assert_eq!(cfg.gc_zombie_task(5, 6).key, "GCZombie-5-6");
        let store = cfg.gc_store_task();
        assert_eq!(store.key, format!("GCStore-{}", store.create_time));
    }

    #[test]
    fn expiry_and_retry_predicates() {
        let cfg = TaskConfig::default();
        let mut task = cfg.seal_task(object(1, 0), StorageParams::default(), vec![], vec![]);
        assert_eq!(task.retry_limit, 10);
        assert!(!task.expired());
        assert!(task.expired_at(task.update_time + task.timeout + 1));
        assert!(!task.expired_at(task.update_time + task.timeout));

        task.update_time -= 100;
        assert!(task.expired());
        assert!(!task.active());
        task.retry = 11;
        assert!(task.retry_exceeded());
        assert!(task.active());
    }

    #[test]
    fn estimates_by_kind() {
        let cfg = TaskConfig::default();
        let replicate = cfg.replicate_task(object(1, 0), StorageParams::default());
        let est = replicate.limit_estimate();
        assert_eq!(est.memory, replicate_memory_limit());
        assert_eq!(est.tasks, 1);
        assert_eq!(est.tasks_high, 1);

        let gc = cfg.gc_object_task(1, 10);
        assert_eq!(gc.limit_estimate().tasks_medium, 1);
        assert_eq!(gc.limit_estimate().memory, 0);

        let upload = cfg.upload_task(object(1, 0), StorageParams::default());
        assert_eq!(upload.limit_estimate(), ResourceLimit::zero());
        assert_eq!(upload.priority, UNSCHEDULED_PRIORITY);
    }
}
