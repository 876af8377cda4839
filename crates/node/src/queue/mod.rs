//! Bounded task queues with pluggable pickup and collection strategies.

mod priority;
mod task_queue;

pub use priority::PriorityQueue;
pub use task_queue::{QueueState, TaskQueue};

use crate::task::Task;
use rand::Rng;
use std::sync::Arc;

/// Chooses one of the candidates, returning its index.
pub type PickupFn = Arc<dyn Fn(&[&Task]) -> Option<usize> + Send + Sync>;
/// Whether a queued task may be handed out right now.
pub type PickupFilterFn = Arc<dyn Fn(&Task) -> bool + Send + Sync>;
/// Cleans a queue; runs with the queue locked.
pub type CollectionFn = Arc<dyn Fn(&mut QueueState) + Send + Sync>;

#[derive(Clone)]
pub struct Strategy {
    pub pickup: PickupFn,
    pub pickup_filter: PickupFilterFn,
    pub collection: CollectionFn,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            pickup: Arc::new(pickup_by_priority),
            pickup_filter: Arc::new(|_| true),
            collection: Arc::new(|_| {}),
        }
    }
}

impl Strategy {
    /// Picks up fresh or timed-out tasks with retries left; drops tasks whose
    /// retries are spent and which have timed out.
    pub fn retry_policy() -> Self {
        Self {
            pickup_filter: Arc::new(pickup_filter_by_retry),
            collection: Arc::new(|state: &mut QueueState| {
                state.retain(|task| !task.active());
            }),
            ..Self::default()
        }
    }

    /// Picks up fresh or timed-out tasks; drops timed-out tasks.
    pub fn timeout_policy() -> Self {
        Self {
            pickup_filter: Arc::new(pickup_filter_by_timeout),
            collection: Arc::new(|state: &mut QueueState| {
                state.retain(|task| !task.expired());
            }),
            ..Self::default()
        }
    }

    pub fn with_collection(mut self, collection: CollectionFn) -> Self {
        self.collection = collection;
        self
    }
}

pub fn pickup_filter_by_retry(task: &Task) -> bool {
    task.retry == 0 || (!task.retry_exceeded() && task.expired())
}

pub fn pickup_filter_by_timeout(task: &Task) -> bool {
    task.retry == 0 || task.expired()
}

/// Weighted random choice where each candidate weighs its priority.
pub fn pickup_by_priority(tasks: &[&Task]) -> Option<usize> {
    match tasks.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }
    let total: u64 = tasks.iter().map(|t| u64::from(t.priority)).sum();
    if total == 0 {
        return Some(0);
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for (idx, task) in tasks.iter().enumerate() {
        let weight = u64::from(task.priority);
        if roll < weight {
            return Some(idx);
        }
        roll -= weight;
    }
    Some(tasks.len() - 1)
}
