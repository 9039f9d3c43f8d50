//! Recovery - runs released tasks and decides what happens after a run
//!
//! [`TaskRunner`] is the dispatcher's [`Launcher`]: it executes the task,
//! judges the run, and either finalizes the task or re-submits it according
//! to its recovery policy. [`plan`] holds the policy decision itself.

use crate::dispatcher::Launcher;
use crate::executor::{Executor, RunReport};
use crate::persist::{task_record, RecordSink};
use crate::registry::TaskRegistry;
use crate::state::TaskState;
use crate::task::{parse_delay, RecoveryPolicy, SharedTask, Task};
use crate::zone::ZoneCoordinator;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What to do with a task after a failed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// No further attempt; the failure is final
    Finalize,
    /// Re-enter the registry with a new start time
    Rerun {
        start: DateTime<Local>,
        resume_from: usize,
    },
    /// Hand the task to another host of the zone
    Elsewhere { preferred: Option<String> },
    /// Queue the task for deferred batch execution
    Batch { queue: Option<String> },
}

/// Decide how a failed run of `task` is recovered
pub fn plan(task: &Task, report: &RunReport, now: DateTime<Local>) -> RecoveryPlan {
    if !task.can_retry() {
        return RecoveryPlan::Finalize;
    }

    let rerun = |start: DateTime<Local>, resume_from: usize| {
        if task.expired_at(start) {
            RecoveryPlan::Finalize
        } else {
            RecoveryPlan::Rerun { start, resume_from }
        }
    };

    match task.recovery {
        RecoveryPolicy::None => RecoveryPlan::Finalize,
        RecoveryPolicy::RerunTask => rerun(now, 0),
        RecoveryPolicy::RerunFailed => {
            let resume_from = report.first_failure().map(|o| o.index).unwrap_or(0);
            rerun(now, resume_from)
        }
        RecoveryPolicy::RerunTaskDelay => {
            let delay = task
                .recovery_value
                .as_deref()
                .and_then(parse_delay)
                .and_then(|d| chrono::Duration::from_std(d).ok());
            match delay {
                Some(delay) => rerun(now + delay, 0),
                None => RecoveryPlan::Finalize,
            }
        }
        RecoveryPolicy::RerunTaskDifferentHost => RecoveryPlan::Elsewhere {
            preferred: task.recovery_value.clone(),
        },
        RecoveryPolicy::Batch => RecoveryPlan::Batch {
            queue: task.recovery_value.clone(),
        },
    }
}

/// Executes released tasks and applies their recovery policy
pub struct TaskRunner {
    host: String,
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn Executor>,
    zone: Arc<dyn ZoneCoordinator>,
    sink: Option<Arc<dyn RecordSink>>,
}

impl TaskRunner {
    pub fn new(
        host: impl Into<String>,
        registry: Arc<TaskRegistry>,
        executor: Arc<dyn Executor>,
        zone: Arc<dyn ZoneCoordinator>,
    ) -> Self {
        Self {
            host: host.into(),
            registry,
            executor,
            zone,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run a task that is in `RUNNING` once and move it on
    pub async fn run(&self, task: SharedTask) {
        let snapshot = {
            let mut t = task.write();
            t.exec_host = Some(self.host.clone());
            t.clone()
        };

        let report = self.executor.execute(&snapshot).await;
        let verdict = report.verdict(&snapshot);

        {
            let mut t = task.write();
            t.is_old = true;
            if let Err(e) = t.transition(verdict) {
                error!(task_id = %t.id, "{}", e);
                return;
            }
        }

        match verdict {
            TaskState::Successful => {
                info!(
                    task_id = %snapshot.id,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "Task succeeded"
                );
                self.finalize(task, Some(&report)).await;
            }
            _ => {
                warn!(
                    task_id = %snapshot.id,
                    state = %verdict,
                    attempt = u32::from(snapshot.retries) + 1,
                    "Run failed: {}",
                    report.failure_summary(verdict).unwrap_or_default()
                );
                self.recover(task, report).await;
            }
        }
    }

    async fn recover(&self, task: SharedTask, report: RunReport) {
        let (decision, snapshot) = {
            let t = task.read();
            (plan(&t, &report, Local::now()), t.clone())
        };
        let id = snapshot.id.clone();

        match decision {
            RecoveryPlan::Finalize => {
                self.finalize(task, Some(&report)).await;
            }
            RecoveryPlan::Rerun { start, resume_from } => {
                let requeued = {
                    let mut t = task.write();
                    t.retries += 1;
                    t.start = start;
                    t.resume_from = resume_from;
                    t.transition(TaskState::PendingStart)
                };
                if let Err(e) = requeued {
                    error!(task_id = %id, "{}", e);
                    return;
                }

                info!(
                    task_id = %id,
                    policy = snapshot.recovery.name(),
                    retry = u32::from(snapshot.retries) + 1,
                    resume_from,
                    start = %start,
                    "Re-submitting task"
                );
                if let Err(e) = self.registry.reschedule(&id) {
                    error!(task_id = %id, "Failed to re-submit: {}", e);
                }
            }
            RecoveryPlan::Elsewhere { preferred } => {
                match self
                    .zone
                    .run_elsewhere(&snapshot, preferred.as_deref())
                    .await
                {
                    Ok(host) => {
                        info!(task_id = %id, host = %host, "Task handed to another host");
                        {
                            let mut t = task.write();
                            t.retries += 1;
                            t.exec_host = Some(host);
                        }
                        self.finalize(task, Some(&report)).await;
                    }
                    Err(e) => {
                        warn!(task_id = %id, zone = self.zone.name(), "Cannot move task: {}", e);
                        self.finalize(task, Some(&report)).await;
                    }
                }
            }
            RecoveryPlan::Batch { queue } => {
                match self.zone.enqueue_batch(&snapshot, queue.as_deref()).await {
                    Ok(()) => {
                        info!(task_id = %id, "Task queued for batch execution");
                        task.write().retries += 1;
                        self.finalize(task, Some(&report)).await;
                    }
                    Err(e) => {
                        warn!(task_id = %id, zone = self.zone.name(), "Cannot queue task: {}", e);
                        self.finalize(task, Some(&report)).await;
                    }
                }
            }
        }
    }

    /// Record (if requested) and retire a task in its final state
    async fn finalize(&self, task: SharedTask, last_run: Option<&RunReport>) {
        let (id, state, persist, record) = {
            let t = task.read();
            (t.id.clone(), t.state, t.persist, task_record(&t, last_run))
        };

        if state.is_failure() {
            warn!(task_id = %id, state = %state, retries = record.retries, "Task failed");
        }

        if persist {
            match &self.sink {
                Some(sink) => {
                    if let Err(e) = sink.record(record).await {
                        error!(task_id = %id, "Failed to persist task record: {}", e);
                    }
                }
                None => debug!(task_id = %id, "No record sink configured"),
            }
        }

        self.registry.retire(&id, state);
    }
}

#[async_trait]
impl Launcher for TaskRunner {
    async fn launch(&self, task: SharedTask) {
        self.run(task).await;
    }

    async fn retire(&self, task: SharedTask) {
        self.finalize(task, None).await;
    }
}
