use super::TaskType;
use crate::error::{SpError, SpResult};
use crate::rcmgr::TaskLevel;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

pub const UNSCHEDULED_PRIORITY: u8 = 0;
pub const DEFAULT_LOW_WATERMARK: u8 = 85;
pub const DEFAULT_HIGH_WATERMARK: u8 = 170;

#[derive(Debug, Clone)]
struct PriorityMap {
    priorities: HashMap<TaskType, u8>,
    low: u8,
    high: u8,
}

impl Default for PriorityMap {
    fn default() -> Self {
        let priorities = HashMap::from([
            (TaskType::UploadObject, UNSCHEDULED_PRIORITY),
            (TaskType::DownloadObject, UNSCHEDULED_PRIORITY),
            (TaskType::ReceivePiece, UNSCHEDULED_PRIORITY),
            (TaskType::GcStore, 21),
            (TaskType::GcZombiePiece, 42),
            (TaskType::GcObject, 85),
            (TaskType::ReplicatePiece, 170),
            (TaskType::SealObject, 255),
        ]);
        Self {
            priorities,
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
        }
    }
}

/// Priority of each task type and the watermarks splitting priorities into levels.
#[derive(Debug, Default)]
pub struct TaskPriorities {
    inner: RwLock<PriorityMap>,
}

static GLOBAL: OnceLock<TaskPriorities> = OnceLock::new();

impl TaskPriorities {
    pub fn global() -> &'static TaskPriorities {
        GLOBAL.get_or_init(TaskPriorities::default)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PriorityMap> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PriorityMap> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn priority(&self, task_type: TaskType) -> u8 {
        self.read()
            .priorities
            .get(&task_type)
            .copied()
            .unwrap_or(UNSCHEDULED_PRIORITY)
    }

    pub fn set_priority(&self, task_type: TaskType, priority: u8) {
        self.write().priorities.insert(task_type, priority);
    }

    pub fn low_watermark(&self) -> u8 {
        self.read().low
    }

    pub fn high_watermark(&self) -> u8 {
        self.read().high
    }

    pub fn set_low_watermark(&self, low: u8) -> SpResult<()> {
        let mut map = self.write();
        if low > map.high {
            return Err(SpError::InvalidParameters(format!(
                "low watermark {low} above high watermark {}",
                map.high
            )));
        }
        map.low = low;
        Ok(())
    }

    pub fn set_high_watermark(&self, high: u8) -> SpResult<()> {
        let mut map = self.write();
        if high < map.low {
            return Err(SpError::InvalidParameters(format!(
                "high watermark {high} below low watermark {}",
                map.low
            )));
        }
        map.high = high;
        Ok(())
    }

    pub fn level(&self, priority: u8) -> TaskLevel {
        let map = self.read();
        if priority >= map.high {
            TaskLevel::High
        } else if priority < map.low {
            TaskLevel::Low
        } else {
            TaskLevel::Medium
        }
    }

    pub fn task_level(&self, task_type: TaskType) -> TaskLevel {
        self.level(self.priority(task_type))
    }

    /// Distinct scheduled priorities, ascending.
    pub fn scheduled_priorities(&self) -> Vec<u8> {
        let mut all: Vec<u8> = self
            .read()
            .priorities
            .values()
            .copied()
            .filter(|p| *p != UNSCHEDULED_PRIORITY)
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}
