//! Day boundary tests: tasks still pending at midnight carry over
//!
//! `cargo test -p cadence-task --test rollover_test`

#![cfg(unix)]

use cadence_foundation::Conf;
use cadence_task::{Cadence, MemorySink, NewTaskRequest, TaskId, TaskState};
use chrono::{Days, Duration as ChronoDuration, Local};
use std::sync::Arc;
use std::time::Duration;

fn start_cadence() -> Arc<Cadence> {
    Cadence::builder(Conf::default().self_host("test-host"))
        .sink(Arc::new(MemorySink::new()))
        .build()
        .expect("build failed")
}

async fn wait_final(cadence: &Cadence, id: &TaskId, limit: Duration) -> Option<TaskState> {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Some(state) = cadence.registry().final_state(id) {
            return Some(state);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

fn state_of(cadence: &Cadence, id: &TaskId) -> Option<TaskState> {
    cadence.registry().get(id).map(|t| t.read().state)
}

#[tokio::test]
async fn test_waiting_dependent_survives_midnight() {
    let cadence = start_cadence();
    let registry = Arc::clone(cadence.registry());
    let tomorrow = Local::now().date_naive() + Days::new(1);

    let parent = cadence
        .submit(NewTaskRequest::new(
            (Local::now() + ChronoDuration::days(1)).timestamp(),
            vec!["true".into()],
            5,
        ))
        .unwrap();
    let mut child = NewTaskRequest::new(Local::now().timestamp() + 1, vec!["true".into()], 5);
    child.dependency = Some(parent.to_string());
    let child = cadence.submit(child).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state_of(&cadence, &child), Some(TaskState::PendingDeps));

    registry.roll_over(tomorrow);
    assert!(registry.is_today(&child));
    assert!(registry.is_today(&parent));

    // The dependency finishes after midnight
    registry.retire(&parent, TaskState::Successful);

    assert_eq!(
        wait_final(&cadence, &child, Duration::from_secs(6)).await,
        Some(TaskState::Successful)
    );
    assert_eq!(registry.pending_len(), 0);
    cadence.shutdown();
}

#[tokio::test]
async fn test_overdue_reschedule_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let cadence = start_cadence();
    let registry = Arc::clone(cadence.registry());

    let id = cadence
        .submit(NewTaskRequest::new(
            Local::now().timestamp() + 2,
            vec![format!("touch {}", marker.display())],
            5,
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A retry whose start is dated before the current day
    if let Some(task) = registry.get(&id) {
        task.write().start = Local::now() - ChronoDuration::days(1);
    }
    registry.reschedule(&id).unwrap();
    assert!(registry.is_today(&id));

    assert_eq!(
        wait_final(&cadence, &id, Duration::from_secs(6)).await,
        Some(TaskState::Successful)
    );
    assert!(marker.exists());
    cadence.shutdown();
}

#[tokio::test]
async fn test_rollover_drops_only_future_days() {
    let cadence = start_cadence();
    let registry = Arc::clone(cadence.registry());
    let today = Local::now().date_naive();

    let later = cadence
        .submit(NewTaskRequest::new(
            (Local::now() + ChronoDuration::days(3)).timestamp(),
            vec!["true".into()],
            5,
        ))
        .unwrap();
    let soon = cadence
        .submit(NewTaskRequest::new(
            (Local::now() + ChronoDuration::hours(1)).timestamp(),
            vec!["true".into()],
            5,
        ))
        .unwrap();

    registry.roll_over(today + Days::new(1));
    assert!(registry.is_today(&soon));
    assert!(!registry.is_today(&later));

    registry.roll_over(today + Days::new(3));
    assert!(registry.is_today(&later));
    assert_eq!(registry.pending_len(), 2);
    cadence.shutdown();
}
