//! Outcome of one run and the verdict over it

use crate::state::TaskState;
use crate::task::Task;
use std::time::Duration;

/// How one command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Exited(i32),
    /// Terminated by a signal it did not handle
    Signalled(i32),
    /// Killed because the run's deadline passed
    TimedOut,
    /// Never started, or its output could not be collected
    SpawnFailed { kind: FailureKind, message: String },
}

/// Classification of a failed command, kept in logs and records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Ran and exited non-zero
    CommandFailed,
    /// Retrying on this host will not help (missing or non-executable command)
    HostFatal,
    /// May succeed on a later attempt
    Transient,
    Timeout,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::CommandFailed => "command-failed",
            FailureKind::HostFatal => "host-fatal",
            FailureKind::Transient => "transient",
            FailureKind::Timeout => "timeout",
        }
    }
}

/// Result of one command of a run
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Position in the task's command list
    pub index: usize,
    pub command: String,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            CommandStatus::Exited(0) => None,
            // sh: 126 = found but not executable, 127 = not found
            CommandStatus::Exited(126) | CommandStatus::Exited(127) => {
                Some(FailureKind::HostFatal)
            }
            CommandStatus::Exited(_) | CommandStatus::Signalled(_) => {
                Some(FailureKind::CommandFailed)
            }
            CommandStatus::TimedOut => Some(FailureKind::Timeout),
            CommandStatus::SpawnFailed { kind, .. } => Some(*kind),
        }
    }
}

/// Everything one run produced
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Executed commands in order; the last one may have failed
    pub outcomes: Vec<CommandOutcome>,
    pub duration: Duration,
}

impl RunReport {
    pub fn timed_out(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == CommandStatus::TimedOut)
    }

    /// Exit code of the last executed command
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcomes.last().map(|o| &o.status) {
            Some(CommandStatus::Exited(code)) => Some(*code),
            _ => None,
        }
    }

    /// stdout of all executed commands, concatenated
    pub fn stdout(&self) -> String {
        self.outcomes.iter().map(|o| o.stdout.as_str()).collect()
    }

    /// stderr of all executed commands, concatenated
    pub fn stderr(&self) -> String {
        self.outcomes.iter().map(|o| o.stderr.as_str()).collect()
    }

    /// First command that did not exit 0; the sequence stopped there
    pub fn first_failure(&self) -> Option<&CommandOutcome> {
        self.outcomes.iter().find(|o| !o.succeeded())
    }

    fn spawn_failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, CommandStatus::SpawnFailed { .. }))
    }

    /// State the task moves to after this run
    ///
    /// A sequence stopped by a non-zero exit fails unless the task declares an
    /// `EXIT_CODE` test, which then judges the last exit status.
    pub fn verdict(&self, task: &Task) -> TaskState {
        if self.timed_out() {
            return TaskState::FailedTimeout;
        }
        if self.spawn_failed() {
            return TaskState::FailedTest;
        }
        if self.first_failure().is_some() && !task.has_exit_code_test() {
            return TaskState::FailedTest;
        }

        let (exit_code, stdout, stderr) = (self.exit_code(), self.stdout(), self.stderr());
        if task
            .tests
            .iter()
            .all(|test| test.passes(exit_code, &stdout, &stderr))
        {
            TaskState::Successful
        } else {
            TaskState::FailedTest
        }
    }

    /// One-line description of why the run failed, for logs and records
    pub fn failure_summary(&self, verdict: TaskState) -> Option<String> {
        if verdict == TaskState::Successful {
            return None;
        }

        match self.first_failure() {
            Some(outcome) => {
                let kind = outcome.failure_kind().unwrap_or(FailureKind::CommandFailed);
                let detail = match &outcome.status {
                    CommandStatus::Exited(code) => format!("exit status {}", code),
                    CommandStatus::Signalled(sig) => format!("killed by signal {}", sig),
                    CommandStatus::TimedOut => "deadline exceeded".to_string(),
                    CommandStatus::SpawnFailed { message, .. } => message.clone(),
                };
                Some(format!(
                    "{}: command {} ({}) {}",
                    kind.name(),
                    outcome.index,
                    outcome.command,
                    detail
                ))
            }
            None => Some("test-failed: a declared test did not pass".to_string()),
        }
    }
}
