//! Task definition and types

use crate::state::TaskState;
use cadence_foundation::{Error, Result};
use chrono::{DateTime, Local, NaiveDate};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A task shared between the registry, the dispatcher and the runner
pub type SharedTask = Arc<RwLock<Task>>;

// ============================================================================
// Tests
// ============================================================================

/// How a finished run is validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestMethod {
    ExitCode,
    StdoutMatch,
    StdoutEmpty,
    StderrMatch,
    StderrEmpty,
    None,
}

impl TestMethod {
    /// Map a wire name; `None` for anything unrecognized
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "EXIT_CODE" => Some(Self::ExitCode),
            "STDOUT_MATCH" => Some(Self::StdoutMatch),
            "STDOUT_EMPTY" => Some(Self::StdoutEmpty),
            "STDERR_MATCH" => Some(Self::StderrMatch),
            "STDERR_EMPTY" => Some(Self::StderrEmpty),
            "NONE" => Some(Self::None),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExitCode => "EXIT_CODE",
            Self::StdoutMatch => "STDOUT_MATCH",
            Self::StdoutEmpty => "STDOUT_EMPTY",
            Self::StderrMatch => "STDERR_MATCH",
            Self::StderrEmpty => "STDERR_EMPTY",
            Self::None => "NONE",
        }
    }
}

/// A post-execution check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub method: TestMethod,
    pub value: String,
    /// Invert the method's raw result
    pub fail_on_true: bool,
}

impl Test {
    pub fn new(method: TestMethod, value: impl Into<String>) -> Self {
        Self {
            method,
            value: value.into(),
            fail_on_true: false,
        }
    }

    pub fn fail_on_true(mut self) -> Self {
        self.fail_on_true = true;
        self
    }

    /// Expected exit code of an `EXIT_CODE` test; an empty value means 0
    pub fn expected_exit_code(&self) -> Option<i32> {
        let value = self.value.trim();
        if value.is_empty() {
            Some(0)
        } else {
            value.parse().ok()
        }
    }

    /// Raw boolean result of the method, before `fail_on_true`
    fn raw(&self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> bool {
        match self.method {
            TestMethod::ExitCode => {
                exit_code.is_some() && exit_code == self.expected_exit_code()
            }
            TestMethod::StdoutMatch => matches_pattern(&self.value, stdout),
            TestMethod::StdoutEmpty => stdout.trim().is_empty(),
            TestMethod::StderrMatch => matches_pattern(&self.value, stderr),
            TestMethod::StderrEmpty => stderr.trim().is_empty(),
            TestMethod::None => true,
        }
    }

    /// Whether the run passes this test
    pub fn passes(&self, exit_code: Option<i32>, stdout: &str, stderr: &str) -> bool {
        self.raw(exit_code, stdout, stderr) != self.fail_on_true
    }
}

fn matches_pattern(pattern: &str, haystack: &str) -> bool {
    Regex::new(pattern)
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

// ============================================================================
// Recovery
// ============================================================================

/// Action taken when a run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPolicy {
    #[default]
    None,
    RerunTask,
    RerunFailed,
    RerunTaskDelay,
    RerunTaskDifferentHost,
    Batch,
}

impl RecoveryPolicy {
    /// Map a wire name; the empty string is `None`
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "NONE" => Some(Self::None),
            "RERUN_TASK" => Some(Self::RerunTask),
            "RERUN_FAILED" => Some(Self::RerunFailed),
            "RERUN_TASK_DELAY" => Some(Self::RerunTaskDelay),
            "RERUN_TASK_DIFFERENT_HOST" => Some(Self::RerunTaskDifferentHost),
            "BATCH" => Some(Self::Batch),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::RerunTask => "RERUN_TASK",
            Self::RerunFailed => "RERUN_FAILED",
            Self::RerunTaskDelay => "RERUN_TASK_DELAY",
            Self::RerunTaskDifferentHost => "RERUN_TASK_DIFFERENT_HOST",
            Self::Batch => "BATCH",
        }
    }
}

/// Parse a recovery delay: `90`, `90s`, `5m` or `2h`
pub fn parse_delay(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (digits, unit) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&value[..i], c),
        _ => (value, 's'),
    };
    let amount: u64 = digits.trim().parse().ok()?;
    let secs = match unit {
        's' => amount,
        'm' => amount.checked_mul(60)?,
        'h' => amount.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

// ============================================================================
// Task
// ============================================================================

/// A schedulable unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// When execution should start
    pub start: DateTime<Local>,

    /// After this, the task is not retried any more
    pub end: Option<DateTime<Local>>,

    /// Commands to execute, verbatim and in order
    pub commands: Vec<String>,

    pub tests: Vec<Test>,

    pub recovery: RecoveryPolicy,

    /// Delay, target host or batch queue, depending on `recovery`
    pub recovery_value: Option<String>,

    pub max_retries: u8,

    /// Wall-clock budget of one run
    pub timeout: Duration,

    /// Task that must succeed before this one runs
    pub dependency: Option<TaskId>,

    pub state: TaskState,

    /// Times this task has been re-submitted
    pub retries: u8,

    /// Set once the task finished at least one run
    pub is_old: bool,

    /// Record the final state when the task finishes
    pub persist: bool,

    /// Host that last executed the task
    pub exec_host: Option<String>,

    /// Index of the first command the next run executes
    pub resume_from: usize,

    pub created_at: DateTime<Local>,

    pub started_at: Option<DateTime<Local>>,

    pub completed_at: Option<DateTime<Local>>,
}

impl Task {
    /// Create a new task in `PENDING_START`
    pub fn new(id: impl Into<TaskId>, start: DateTime<Local>, commands: Vec<String>) -> Self {
        Self {
            id: id.into(),
            start,
            end: None,
            commands,
            tests: Vec::new(),
            recovery: RecoveryPolicy::None,
            recovery_value: None,
            max_retries: 1,
            timeout: Duration::from_secs(60),
            dependency: None,
            state: TaskState::PendingStart,
            retries: 0,
            is_old: false,
            persist: false,
            exec_host: None,
            resume_from: 0,
            created_at: Local::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_end(mut self, end: DateTime<Local>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_tests(mut self, tests: Vec<Test>) -> Self {
        self.tests = tests;
        self
    }

    pub fn with_recovery(mut self, policy: RecoveryPolicy, value: Option<String>) -> Self {
        self.recovery = policy;
        self.recovery_value = value;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Wrap for shared ownership
    pub fn into_shared(self) -> SharedTask {
        Arc::new(RwLock::new(self))
    }

    /// Move to `to`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, to: TaskState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::Task(format!(
                "Task {} cannot move from {} to {}",
                self.id, self.state, to
            )));
        }

        match to {
            TaskState::Running => self.started_at = Some(Local::now()),
            s if s.is_terminal() => self.completed_at = Some(Local::now()),
            _ => {}
        }
        self.state = to;
        Ok(())
    }

    /// Whether the task belongs to the today set of `date`: its start falls
    /// on that local calendar day or an earlier one
    pub fn due_by(&self, date: NaiveDate) -> bool {
        self.start.date_naive() <= date
    }

    /// Time left until the start, zero when it already passed
    pub fn until_start(&self, now: DateTime<Local>) -> Duration {
        (self.start - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether a start at `at` would fall after the task's end
    pub fn expired_at(&self, at: DateTime<Local>) -> bool {
        self.end.map(|end| at > end).unwrap_or(false)
    }

    /// Commands still to run, as `(index, command)`
    pub fn remaining_commands(&self) -> impl Iterator<Item = (usize, &str)> {
        self.commands
            .iter()
            .enumerate()
            .skip(self.resume_from)
            .map(|(i, c)| (i, c.as_str()))
    }

    pub fn has_exit_code_test(&self) -> bool {
        self.tests.iter().any(|t| t.method == TestMethod::ExitCode)
    }

    /// Whether another retry is allowed
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}
