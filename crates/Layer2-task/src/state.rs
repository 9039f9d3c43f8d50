//! Task state machine

use serde::{Deserialize, Serialize};

/// Possible states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting for its start time
    PendingStart,

    /// Waiting for its dependency to succeed
    PendingDeps,

    /// Commands are executing
    Running,

    /// All tests passed
    Successful,

    /// A command or test failed
    FailedTest,

    /// The run exceeded its timeout
    FailedTimeout,

    /// Removed before it was released for execution
    Cancelled,
}

impl TaskState {
    /// Check whether `self -> to` is an allowed transition
    ///
    /// A failed state may go back to `PendingStart` when the recovery policy
    /// re-submits the task.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (PendingStart, Running)
                | (PendingStart, PendingDeps)
                | (PendingStart, Cancelled)
                | (PendingDeps, PendingStart)
                | (PendingDeps, Cancelled)
                | (Running, Successful)
                | (Running, FailedTest)
                | (Running, FailedTimeout)
                | (FailedTest, PendingStart)
                | (FailedTimeout, PendingStart)
        )
    }

    /// Check if this is an end-of-run state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Successful
                | TaskState::FailedTest
                | TaskState::FailedTimeout
                | TaskState::Cancelled
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::FailedTest | TaskState::FailedTimeout)
    }

    /// Check if task is waiting to be armed or released
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::PendingStart | TaskState::PendingDeps)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    /// Wire/record name of the state
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::PendingStart => "PENDING_START",
            TaskState::PendingDeps => "PENDING_DEPS",
            TaskState::Running => "RUNNING",
            TaskState::Successful => "SUCCESSFUL",
            TaskState::FailedTest => "FAILED_TEST",
            TaskState::FailedTimeout => "FAILED_TIMEOUT",
            TaskState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(TaskState::PendingStart.can_transition(TaskState::Running));
        assert!(TaskState::Running.can_transition(TaskState::FailedTest));
        assert!(TaskState::FailedTimeout.can_transition(TaskState::PendingStart));
        assert!(TaskState::PendingDeps.can_transition(TaskState::PendingStart));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskState::Running.can_transition(TaskState::Cancelled));
        assert!(!TaskState::Successful.can_transition(TaskState::PendingStart));
        assert!(!TaskState::Cancelled.can_transition(TaskState::Running));
        assert!(!TaskState::PendingStart.can_transition(TaskState::Successful));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Successful.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::FailedTest.is_failure());
        assert!(!TaskState::PendingDeps.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_names() {
        assert_eq!(TaskState::FailedTimeout.to_string(), "FAILED_TIMEOUT");
        assert_eq!(
            serde_json::to_string(&TaskState::PendingStart).unwrap(),
            "\"PENDING_START\""
        );
    }
}
