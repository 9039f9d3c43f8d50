//! Task Registry - pending and today's tasks
//!
//! Two collections, each behind its own lock:
//! - *pending*: every task not yet finalized
//! - *today*: the pending tasks whose start falls on the current local date
//!   or earlier; a task still pending at midnight carries over
//!
//! Both hold the same [`SharedTask`] handles, so a state change made through
//! one is visible through the other. Locks are held only for the mutation
//! itself and are released before the dispatcher is signalled.

use crate::state::TaskState;
use crate::task::{SharedTask, TaskId};
use cadence_foundation::{Error, Result};
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Where a dependency stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    /// Finished successfully
    Satisfied,
    /// Still pending or running
    Waiting,
    /// Finished in any other state, or never known
    Failed,
}

/// Pending/today task collections shared with the dispatcher
pub struct TaskRegistry {
    pending: Mutex<Vec<SharedTask>>,
    today: Mutex<Vec<SharedTask>>,
    /// Final states of tasks retired during this run
    finished: Mutex<HashMap<TaskId, TaskState>>,
    changed: Arc<Notify>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            today: Mutex::new(Vec::new()),
            finished: Mutex::new(HashMap::new()),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever the today set may have changed
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Add a task dated against the current local date
    pub fn add(&self, task: SharedTask) -> Result<()> {
        self.add_on(task, Local::now().date_naive())
    }

    /// Add a task, treating `today` as the current date
    pub fn add_on(&self, task: SharedTask, today: NaiveDate) -> Result<()> {
        let (id, is_today) = {
            let t = task.read();
            (t.id.clone(), t.due_by(today))
        };

        {
            let mut pending = self.pending.lock();
            if pending.iter().any(|t| t.read().id == id) {
                return Err(Error::Task(format!("Task {} already registered", id)));
            }
            pending.push(Arc::clone(&task));
        }

        if is_today {
            self.today.lock().push(task);
        }

        debug!(task_id = %id, today = is_today, "Task registered");
        if is_today {
            self.changed.notify_one();
        }
        Ok(())
    }

    /// Point-in-time copy of the today set
    pub fn snapshot_today(&self) -> Vec<SharedTask> {
        self.today.lock().clone()
    }

    pub fn get(&self, id: &TaskId) -> Option<SharedTask> {
        self.pending
            .lock()
            .iter()
            .find(|t| t.read().id == *id)
            .cloned()
    }

    /// Whether `id` is pending or finished during this run
    pub fn is_known(&self, id: &TaskId) -> bool {
        self.get(id).is_some() || self.finished.lock().contains_key(id)
    }

    pub fn is_today(&self, id: &TaskId) -> bool {
        self.today.lock().iter().any(|t| t.read().id == *id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn today_len(&self) -> usize {
        self.today.lock().len()
    }

    /// Final state of a retired task
    pub fn final_state(&self, id: &TaskId) -> Option<TaskState> {
        self.finished.lock().get(id).copied()
    }

    pub fn dependency_status(&self, id: &TaskId) -> DependencyStatus {
        if self.get(id).is_some() {
            return DependencyStatus::Waiting;
        }
        match self.final_state(id) {
            Some(TaskState::Successful) => DependencyStatus::Satisfied,
            _ => DependencyStatus::Failed,
        }
    }

    /// Re-derive today membership after the task's start time changed
    pub fn reschedule(&self, id: &TaskId) -> Result<()> {
        self.reschedule_on(id, Local::now().date_naive())
    }

    pub fn reschedule_on(&self, id: &TaskId, today: NaiveDate) -> Result<()> {
        let task = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Task {} is not pending", id)))?;
        let is_today = task.read().due_by(today);

        {
            let mut today_set = self.today.lock();
            today_set.retain(|t| t.read().id != *id);
            if is_today {
                today_set.push(task);
            }
        }

        debug!(task_id = %id, today = is_today, "Task rescheduled");
        self.changed.notify_one();
        Ok(())
    }

    /// Remove a finalized task from both sets and remember its final state
    pub fn retire(&self, id: &TaskId, state: TaskState) {
        // Record first so dependents never observe an unknown id
        self.finished.lock().insert(id.clone(), state);
        self.pending.lock().retain(|t| t.read().id != *id);
        self.today.lock().retain(|t| t.read().id != *id);

        info!(task_id = %id, state = %state, "Task retired");
        self.changed.notify_one();
    }

    /// Day rollover: today becomes the pending tasks dated `date` or earlier
    pub fn roll_over(&self, date: NaiveDate) {
        let due: Vec<SharedTask> = self
            .pending
            .lock()
            .iter()
            .filter(|t| t.read().due_by(date))
            .cloned()
            .collect();
        let count = due.len();

        *self.today.lock() = due;

        info!(date = %date, tasks = count, "Rolled over to new day");
        self.changed.notify_one();
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
