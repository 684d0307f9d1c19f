// Progress table for running bulk batches
//
// Lifecycle: `begin` inserts the entry, the returned guard mutates it, and
// dropping the guard removes it. Absence of a task id is the terminal signal
// pollers wait for, so removal happens on every exit path.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::BatchTaskState;

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<String, BatchTaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch of `total` items under `task_id`.
    pub fn begin(&self, task_id: &str, total: usize) -> OrchestratorResult<TaskGuard> {
        match self.tasks.entry(task_id.to_string()) {
            Entry::Occupied(_) => Err(OrchestratorError::DuplicateTask(task_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(BatchTaskState::new(task_id, total));
                debug!("Task {} registered ({} items)", task_id, total);
                Ok(TaskGuard {
                    registry: self.clone(),
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<BatchTaskState> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn update(&self, task_id: &str, apply: impl FnOnce(&mut BatchTaskState)) {
        if let Some(mut state) = self.tasks.get_mut(task_id) {
            apply(&mut state);
            state.recompute_progress();
        }
    }
}

/// Exclusive handle on one task's entry; removes it on drop
pub struct TaskGuard {
    registry: TaskRegistry,
    task_id: String,
}

impl TaskGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn record_success(&self) {
        self.registry.update(&self.task_id, |s| s.success += 1);
    }

    pub fn record_failure(&self) {
        self.registry.update(&self.task_id, |s| s.failed += 1);
    }

    pub fn snapshot(&self) -> Option<BatchTaskState> {
        self.registry.get(&self.task_id)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.tasks.remove(&self.task_id);
        debug!("Task {} removed", self.task_id);
    }
}
