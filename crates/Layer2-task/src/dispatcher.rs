//! Dispatcher - the single loop that decides when a task runs
//!
//! The loop owns the waiting set and a min-heap of wake deadlines. It reacts to:
//! - the registry's "today changed" notification: arm every eligible task of
//!   the today set that is not waiting yet
//! - the earliest deadline: release due tasks to the [`Launcher`]
//! - commands from a [`DispatcherHandle`]: cancel, shutdown
//!
//! Cancelling removes the task from the waiting set; its heap entry stays
//! behind and is dropped when popped, because the id is gone or its
//! generation no longer matches.
//!
//! Launches and retirements run in their own tokio tasks; the loop itself
//! only waits on its three inputs.

use crate::registry::{DependencyStatus, TaskRegistry};
use crate::state::TaskState;
use crate::task::{SharedTask, TaskId};
use async_trait::async_trait;
use cadence_foundation::{Error, Result};
use chrono::Local;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Receives tasks the dispatcher releases or gives up on
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Run a released task; it is already in `RUNNING`
    async fn launch(&self, task: SharedTask);

    /// Finalize a task that will never run (cancelled)
    async fn retire(&self, task: SharedTask);
}

/// Commands accepted by the dispatcher loop
#[derive(Debug)]
pub enum DispatcherCommand {
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Cloneable handle to a running dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    /// Cancel a task that has not started yet
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatcherCommand::Cancel {
                id: id.clone(),
                reply,
            })
            .map_err(|_| Error::Dispatch("dispatcher is not running".to_string()))?;

        rx.await
            .map_err(|_| Error::Dispatch("dispatcher stopped before replying".to_string()))?
    }

    /// Stop the loop; tasks already released keep running
    pub fn shutdown(&self) {
        let _ = self.tx.send(DispatcherCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Waiting-set entry
struct Waiting {
    task: SharedTask,
    generation: u64,
}

/// Wake deadline, ordered earliest first through `Reverse`
type Timer = Reverse<(Instant, u64, TaskId)>;

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    launcher: Arc<dyn Launcher>,
    commands: mpsc::UnboundedReceiver<DispatcherCommand>,
    waiting: HashMap<TaskId, Waiting>,
    timers: BinaryHeap<Timer>,
    generation: u64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        launcher: Arc<dyn Launcher>,
    ) -> (Self, DispatcherHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let dispatcher = Self {
            registry,
            launcher,
            commands,
            waiting: HashMap::new(),
            timers: BinaryHeap::new(),
            generation: 0,
        };
        (dispatcher, DispatcherHandle { tx })
    }

    /// Run the loop on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let changed = self.registry.changed();
        info!("Dispatcher started");

        self.reconcile();

        loop {
            let next = self.timers.peek().map(|Reverse((deadline, _, _))| *deadline);

            tokio::select! {
                _ = changed.notified() => {
                    self.reconcile();
                }
                command = self.commands.recv() => match command {
                    Some(DispatcherCommand::Cancel { id, reply }) => match self.cancel(&id) {
                        // Reply once the task is finalized
                        Ok(task) => self.retire(task, Some(reply)),
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    },
                    Some(DispatcherCommand::Shutdown) | None => break,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    self.release_due();
                }
            }
        }

        info!(waiting = self.waiting.len(), "Dispatcher stopped");
    }

    /// Arm every eligible today task that is not waiting yet
    fn reconcile(&mut self) {
        let today = self.registry.snapshot_today();

        // Tasks that left the today set (rollover) stop waiting
        let present: HashSet<TaskId> = today.iter().map(|t| t.read().id.clone()).collect();
        self.waiting.retain(|id, _| present.contains(id));

        for task in today {
            let (id, state, dependency) = {
                let t = task.read();
                (t.id.clone(), t.state, t.dependency.clone())
            };

            if self.waiting.contains_key(&id) || !state.is_pending() {
                continue;
            }

            if let Some(dependency) = dependency {
                match self.registry.dependency_status(&dependency) {
                    DependencyStatus::Waiting => {
                        if state == TaskState::PendingStart {
                            self.move_to(&task, TaskState::PendingDeps);
                            debug!(task_id = %id, dependency = %dependency, "Waiting for dependency");
                        }
                        continue;
                    }
                    DependencyStatus::Failed => {
                        warn!(task_id = %id, dependency = %dependency, "Dependency did not succeed, cancelling");
                        if self.move_to(&task, TaskState::Cancelled) {
                            self.retire(task, None);
                        }
                        continue;
                    }
                    DependencyStatus::Satisfied => {
                        if state == TaskState::PendingDeps
                            && !self.move_to(&task, TaskState::PendingStart)
                        {
                            continue;
                        }
                    }
                }
            }

            self.arm(id, task);
        }
    }

    fn arm(&mut self, id: TaskId, task: SharedTask) {
        let delay = task.read().until_start(Local::now());
        let deadline = Instant::now() + delay;

        self.generation += 1;
        let generation = self.generation;
        self.timers.push(Reverse((deadline, generation, id.clone())));

        debug!(task_id = %id, delay_ms = delay.as_millis() as u64, "Task armed");
        self.waiting.insert(id, Waiting { task, generation });
    }

    /// Pop every expired deadline and release its task if still waiting
    fn release_due(&mut self) {
        let now = Instant::now();

        while let Some(Reverse((deadline, generation, _))) = self.timers.peek() {
            if *deadline > now {
                break;
            }
            let generation = *generation;
            let Some(Reverse((_, _, id))) = self.timers.pop() else {
                break;
            };

            let current = self
                .waiting
                .get(&id)
                .map(|w| w.generation == generation)
                .unwrap_or(false);
            if !current {
                debug!(task_id = %id, "Dropping stale wake");
                continue;
            }

            if let Some(waiting) = self.waiting.remove(&id) {
                self.release(id, waiting.task);
            }
        }
    }

    fn release(&self, id: TaskId, task: SharedTask) {
        if !self.move_to(&task, TaskState::Running) {
            return;
        }

        info!(task_id = %id, "Releasing task");
        let launcher = Arc::clone(&self.launcher);
        tokio::spawn(async move {
            launcher.launch(task).await;
        });
    }

    /// Hand a task that will never run to the launcher for finalization
    fn retire(&self, task: SharedTask, reply: Option<oneshot::Sender<Result<()>>>) {
        let launcher = Arc::clone(&self.launcher);
        tokio::spawn(async move {
            launcher.retire(task).await;
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        });
    }

    /// Move a not-yet-running task to `CANCELLED` and return it
    fn cancel(&mut self, id: &TaskId) -> Result<SharedTask> {
        let task = match self.waiting.remove(id) {
            Some(waiting) => waiting.task,
            None => self
                .registry
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("Task {} is not pending", id)))?,
        };

        {
            let mut t = task.write();
            if t.state.is_running() {
                return Err(Error::Task(format!("Task {} is already running", id)));
            }
            if t.state.is_terminal() {
                return Err(Error::Task(format!("Task {} has already finished", id)));
            }
            t.transition(TaskState::Cancelled)?;
        }

        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// Apply a transition, logging a refused one
    fn move_to(&self, task: &SharedTask, to: TaskState) -> bool {
        let mut t = task.write();
        match t.transition(to) {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %t.id, "{}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Records launches; retired tasks are removed from the registry
    struct RecordingLauncher {
        registry: Arc<TaskRegistry>,
        launched: mpsc::UnboundedSender<TaskId>,
        retired: mpsc::UnboundedSender<(TaskId, TaskState)>,
        /// Simulated finalization cost, such as a slow record write
        retire_delay: Duration,
    }

    #[async_trait]
    impl Launcher for RecordingLauncher {
        async fn launch(&self, task: SharedTask) {
            let id = task.read().id.clone();
            let _ = self.launched.send(id);
        }

        async fn retire(&self, task: SharedTask) {
            if !self.retire_delay.is_zero() {
                tokio::time::sleep(self.retire_delay).await;
            }
            let (id, state) = {
                let t = task.read();
                (t.id.clone(), t.state)
            };
            self.registry.retire(&id, state);
            let _ = self.retired.send((id, state));
        }
    }

    struct Harness {
        registry: Arc<TaskRegistry>,
        handle: DispatcherHandle,
        launched: mpsc::UnboundedReceiver<TaskId>,
        retired: mpsc::UnboundedReceiver<(TaskId, TaskState)>,
    }

    fn start() -> Harness {
        start_with(Duration::ZERO)
    }

    fn start_with(retire_delay: Duration) -> Harness {
        let registry = Arc::new(TaskRegistry::new());
        let (launched_tx, launched) = mpsc::unbounded_channel();
        let (retired_tx, retired) = mpsc::unbounded_channel();
        let launcher = Arc::new(RecordingLauncher {
            registry: Arc::clone(&registry),
            launched: launched_tx,
            retired: retired_tx,
            retire_delay,
        });

        let (dispatcher, handle) = Dispatcher::new(Arc::clone(&registry), launcher);
        dispatcher.spawn();

        Harness {
            registry,
            handle,
            launched,
            retired,
        }
    }

    fn task_in(id: &str, delay: ChronoDuration) -> SharedTask {
        Task::new(id, Local::now() + delay, vec!["true".into()]).into_shared()
    }

    #[tokio::test]
    async fn test_releases_task_at_start() {
        let mut h = start();
        let task = task_in("soon", ChronoDuration::milliseconds(50));
        h.registry.add(Arc::clone(&task)).unwrap();

        let id = timeout(Duration::from_secs(2), h.launched.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_str(), "soon");
        assert_eq!(task.read().state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_releases_in_deadline_order() {
        let mut h = start();
        h.registry
            .add(task_in("later", ChronoDuration::milliseconds(150)))
            .unwrap();
        h.registry
            .add(task_in("earlier", ChronoDuration::milliseconds(30)))
            .unwrap();

        let first = timeout(Duration::from_secs(2), h.launched.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), h.launched.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_str(), "earlier");
        assert_eq!(second.as_str(), "later");
    }

    #[tokio::test]
    async fn test_cancel_before_wake_never_dispatches() {
        let mut h = start();
        let task = task_in("doomed", ChronoDuration::milliseconds(200));
        h.registry.add(Arc::clone(&task)).unwrap();

        // Let the dispatcher arm it first
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.handle.cancel(&TaskId::new("doomed")).await.unwrap();

        let (id, state) = h.retired.recv().await.unwrap();
        assert_eq!(id.as_str(), "doomed");
        assert_eq!(state, TaskState::Cancelled);

        // Well past the wake time
        let launched = timeout(Duration::from_millis(400), h.launched.recv()).await;
        assert!(launched.is_err());
        assert_eq!(h.registry.final_state(&id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_running() {
        let mut h = start();

        let err = h.handle.cancel(&TaskId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        h.registry
            .add(task_in("busy", ChronoDuration::milliseconds(10)))
            .unwrap();
        timeout(Duration::from_secs(2), h.launched.recv())
            .await
            .unwrap()
            .unwrap();

        let err = h.handle.cancel(&TaskId::new("busy")).await.unwrap_err();
        assert!(matches!(err, Error::Task(_)));
    }

    #[tokio::test]
    async fn test_slow_retire_does_not_hold_back_releases() {
        let mut h = start_with(Duration::from_secs(2));
        h.registry
            .add(task_in("slow", ChronoDuration::hours(1)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = h.handle.clone();
        let cancelled = tokio::spawn(async move { handle.cancel(&TaskId::new("slow")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.registry
            .add(task_in("quick", ChronoDuration::milliseconds(50)))
            .unwrap();
        let id = timeout(Duration::from_secs(1), h.launched.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_str(), "quick");
        assert!(h.retired.try_recv().is_err());

        // The cancel reply waits for finalization
        cancelled.await.unwrap().unwrap();
        let (id, state) = h.retired.recv().await.unwrap();
        assert_eq!(id.as_str(), "slow");
        assert_eq!(state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_future_day_task_not_armed() {
        let mut h = start();
        h.registry
            .add(task_in("tomorrow", ChronoDuration::days(1)))
            .unwrap();

        let launched = timeout(Duration::from_millis(100), h.launched.recv()).await;
        assert!(launched.is_err());

        // Still cancellable while only pending
        h.handle.cancel(&TaskId::new("tomorrow")).await.unwrap();
        assert_eq!(h.registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_dependency_cancels_dependent() {
        let mut h = start();
        let parent = Task::new("parent", Local::now() + ChronoDuration::hours(1), vec!["true".into()])
            .into_shared();
        let child = Task::new("child", Local::now(), vec!["true".into()])
            .with_dependency("parent")
            .into_shared();
        h.registry.add(Arc::clone(&parent)).unwrap();
        h.registry.add(Arc::clone(&child)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(child.read().state, TaskState::PendingDeps);
        assert!(h.launched.try_recv().is_err());

        h.handle.cancel(&TaskId::new("parent")).await.ok();
        let (id, _) = h.retired.recv().await.unwrap();
        assert_eq!(id.as_str(), "parent");

        // A cancelled parent is not a success: the child is cancelled too
        let (id, state) = timeout(Duration::from_secs(2), h.retired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_str(), "child");
        assert_eq!(state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_satisfied_dependency_releases() {
        let mut h = start();
        h.registry.retire(&TaskId::new("done"), TaskState::Successful);

        let child = Task::new("child", Local::now(), vec!["true".into()])
            .with_dependency("done")
            .into_shared();
        h.registry.add(child).unwrap();

        let id = timeout(Duration::from_secs(2), h.launched.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id.as_str(), "child");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let h = start();
        assert!(h.handle.is_running());
        h.handle.shutdown();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.handle.is_running());
        let err = h.handle.cancel(&TaskId::new("any")).await.unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }
}
