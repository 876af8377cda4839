use super::Strategy;
use crate::error::{SpError, SpResult};
use crate::rcmgr::ResourceLimit;
use crate::task::{Task, TaskKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

/// The tasks of one queue plus the key index. Collection strategies get a
/// mutable view of this while the queue is locked.
pub struct QueueState {
    name: String,
    tasks: Vec<Task>,
    index: HashMap<TaskKey, usize>,
    cap: usize,
}

impl QueueState {
    fn new(name: String, cap: usize) -> Self {
        Self {
            name,
            tasks: Vec::new(),
            index: HashMap::new(),
            cap,
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (idx, task) in self.tasks.iter().enumerate() {
            self.index.insert(task.key.clone(), idx);
        }
    }

    /// Swap-removes `idx`; only the task moved into the hole gets a new index.
    fn remove_at(&mut self, idx: usize) -> Task {
        let task = self.tasks.swap_remove(idx);
        self.index.remove(&task.key);
        if let Some(moved) = self.tasks.get(idx) {
            self.index.insert(moved.key.clone(), idx);
        }
        task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Task> {
        self.index.get(key).and_then(|idx| self.tasks.get(*idx))
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.tasks.iter().map(|t| t.key.clone()).collect()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn push(&mut self, task: Task) -> SpResult<()> {
        if self.index.contains_key(&task.key) {
            warn!(queue = %self.name, key = %task.key, "Task repeated");
            return Err(SpError::TaskRepeated(task.key));
        }
        if self.tasks.len() + 1 > self.cap {
            warn!(queue = %self.name, cap = self.cap, "Queue exceeded");
            return Err(SpError::QueueExceeded(self.name.clone()));
        }
        self.index.insert(task.key.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Task> {
        let task = self.tasks.pop()?;
        self.index.remove(&task.key);
        Some(task)
    }

    pub fn pop_by_key(&mut self, key: &str) -> Option<Task> {
        let idx = *self.index.get(key)?;
        if idx >= self.tasks.len() {
            warn!(queue = %self.name, idx, len = self.tasks.len(), "BUG: index out of bounds");
            self.reindex();
            return None;
        }
        Some(self.remove_at(idx))
    }

    /// Replaces the queued task with the same key, or appends it. Ignores capacity.
    pub fn pop_push(&mut self, task: Task) {
        match self.index.get(&task.key) {
            Some(idx) if *idx < self.tasks.len() => self.tasks[*idx] = task,
            _ => {
                self.index.insert(task.key.clone(), self.tasks.len());
                self.tasks.push(task);
            }
        }
    }

    /// Overwrites the queued task with the same key. Returns `false`, leaving the
    /// queue alone, when no such task is queued.
    pub fn replace(&mut self, task: Task) -> bool {
        match self.index.get(&task.key) {
            Some(idx) if *idx < self.tasks.len() => {
                self.tasks[*idx] = task;
                true
            }
            _ => false,
        }
    }

    /// Keeps the tasks `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&Task) -> bool) {
        self.remove_where(|t| !keep(t));
    }

    /// Removes and returns the tasks `remove` matches, preserving the order of the rest.
    pub fn remove_where(&mut self, mut remove: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let (removed, kept): (Vec<Task>, Vec<Task>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| remove(t));
        self.tasks = kept;
        if !removed.is_empty() {
            debug!(queue = %self.name, removed = removed.len(), "Collected tasks");
            self.reindex();
        }
        removed
    }
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    strategy: RwLock<Strategy>,
    support_limit: bool,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, cap: usize, strategy: Strategy, support_limit: bool) -> Self {
        Self {
            state: Mutex::new(QueueState::new(name.into(), cap)),
            strategy: RwLock::new(strategy),
            support_limit,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn strategy(&self) -> Strategy {
        self.strategy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        *self.strategy.write().unwrap_or_else(|e| e.into_inner()) = strategy;
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn support_limit(&self) -> bool {
        self.support_limit
    }

    pub fn len(&self) -> usize {
        self.state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().is_empty()
    }

    pub fn cap(&self) -> usize {
        self.state().cap()
    }

    pub fn has(&self, key: &str) -> bool {
        self.state().has(key)
    }

    /// Most recently pushed task, left in place.
    pub fn top(&self) -> Option<Task> {
        self.state().tasks.last().cloned()
    }

    pub fn pop(&self) -> Option<Task> {
        self.state().pop()
    }

    pub fn push(&self, task: Task) -> SpResult<()> {
        self.state().push(task)
    }

    pub fn pop_push(&self, task: Task) {
        self.state().pop_push(task)
    }

    pub fn replace(&self, task: Task) -> bool {
        self.state().replace(task)
    }

    pub fn pop_by_key(&self, key: &str) -> Option<Task> {
        self.state().pop_by_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Task> {
        self.state().get(key).cloned()
    }

    pub fn expired(&self, key: &str) -> bool {
        self.state().get(key).is_some_and(|t| t.expired())
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.state().get(key).is_some_and(|t| t.active())
    }

    /// Removes the newest task that passes the pickup filter and fits in `limit`.
    pub fn pop_by_limit(&self, limit: &ResourceLimit) -> Option<Task> {
        let strategy = self.strategy();
        let mut state = self.state();
        let found = state
            .tasks
            .iter()
            .rposition(|t| (strategy.pickup_filter)(t) && limit.not_less(&t.limit_estimate()));
        match found {
            Some(idx) => {
                let task = state.remove_at(idx);
                debug!(queue = %state.name, key = %task.key, "Found matching task");
                Some(task)
            }
            None => {
                debug!(queue = %state.name, "No task fits the limit");
                None
            }
        }
    }

    pub fn run_collection(&self) {
        let strategy = self.strategy();
        let mut state = self.state();
        (strategy.collection)(&mut state);
    }
}
