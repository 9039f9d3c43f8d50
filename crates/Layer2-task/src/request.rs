//! Task and test requests, and their validation into [`Task`]s
//!
//! Requests arrive from untrusted clients. Validation either yields a fully
//! formed task with a freshly generated id, or the first rule that failed.
//! No id is generated for a rejected request.

use crate::task::{parse_delay, RecoveryPolicy, Task, TaskId, Test, TestMethod};
use cadence_foundation::IdGenerator;
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retries granted when a request does not say
pub const DEFAULT_RETRIES: u8 = 1;

/// Longest run timeout a request may ask for (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Why a request was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("ERROR: Task field '{field}' {reason}")]
    InvalidTask { field: &'static str, reason: String },

    #[error("ERROR: {message}")]
    InvalidTest { message: String },
}

impl RequestError {
    fn task(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            field,
            reason: reason.into(),
        }
    }

    fn test(message: impl Into<String>) -> Self {
        Self::InvalidTest {
            message: message.into(),
        }
    }

    /// Offending task field; test errors report `tests`
    pub fn field(&self) -> &str {
        match self {
            Self::InvalidTask { field, .. } => field,
            Self::InvalidTest { .. } => "tests",
        }
    }
}

/// A post-execution check as sent by a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRequest {
    pub method: String,
    pub value: String,
    pub fail_on_true: bool,
}

impl TestRequest {
    pub fn new(method: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            value: value.into(),
            fail_on_true: false,
        }
    }

    /// Convert into a [`Test`]
    pub fn to_test(&self) -> Result<Test, RequestError> {
        let method = TestMethod::from_name(&self.method).ok_or_else(|| {
            RequestError::test(format!("invalid test method specified: {}", self.method))
        })?;

        let test = Test {
            method,
            value: self.value.clone(),
            fail_on_true: self.fail_on_true,
        };

        match method {
            TestMethod::ExitCode if test.expected_exit_code().is_none() => Err(
                RequestError::test(format!("invalid exit code specified: {}", self.value)),
            ),
            TestMethod::StdoutMatch | TestMethod::StderrMatch
                if Regex::new(&self.value).is_err() =>
            {
                Err(RequestError::test(format!(
                    "invalid match pattern specified: {}",
                    self.value
                )))
            }
            _ => Ok(test),
        }
    }
}

/// A request to schedule a new task
///
/// Minimum valid request:
/// `{"new_task":{"start":1475437451, "commands": ["foo"], "timeout":75}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTaskRequest {
    /// Seconds since the epoch
    pub start: Option<i64>,

    /// Seconds since the epoch; absent or zero means no end
    pub end: Option<i64>,

    pub commands: Vec<String>,

    pub tests: Vec<TestRequest>,

    /// Recovery policy name, `NONE` when empty
    pub recovery: String,

    pub recovery_value: Option<String>,

    /// Seconds
    pub timeout: u64,

    pub retries: Option<u8>,

    pub dependency: Option<String>,

    pub persist: bool,
}

/// What validation needs from its surroundings
pub struct ValidationContext<'a> {
    /// The creation-time "now"
    pub now: DateTime<Local>,

    pub ids: &'a dyn IdGenerator,

    /// Whether a dependency id names a task known to this run
    pub is_known: &'a (dyn Fn(&TaskId) -> bool + Send + Sync),
}

impl NewTaskRequest {
    pub fn new(start: i64, commands: Vec<String>, timeout: u64) -> Self {
        Self {
            start: Some(start),
            commands,
            timeout,
            ..Self::default()
        }
    }

    /// Validate into a [`Task`]; the first failing rule wins
    pub fn validate(self, ctx: &ValidationContext<'_>) -> Result<Task, RequestError> {
        let start = Self::validate_start(self.start, ctx.now)?;
        Self::validate_commands(&self.commands)?;
        let timeout = Self::validate_timeout(self.timeout)?;
        let end = Self::validate_end(self.end, start)?;
        let recovery = Self::validate_recovery(&self.recovery, self.recovery_value.as_deref())?;

        let tests = self
            .tests
            .iter()
            .map(TestRequest::to_test)
            .collect::<Result<Vec<_>, _>>()?;

        let dependency = match self.dependency.filter(|d| !d.is_empty()) {
            Some(dep) => {
                let dep = TaskId::new(dep);
                if !(ctx.is_known)(&dep) {
                    return Err(RequestError::task(
                        "dependency",
                        "must reference a known task",
                    ));
                }
                Some(dep)
            }
            None => None,
        };

        // Every rule passed; only now is an id issued
        let mut task = Task::new(TaskId::new(ctx.ids.generate()), start, self.commands)
            .with_tests(tests)
            .with_recovery(recovery, self.recovery_value)
            .with_max_retries(self.retries.unwrap_or(DEFAULT_RETRIES))
            .with_timeout(timeout)
            .with_persist(self.persist);
        task.end = end;
        task.dependency = dependency;
        task.created_at = ctx.now;
        Ok(task)
    }

    fn validate_start(start: Option<i64>, now: DateTime<Local>) -> Result<DateTime<Local>, RequestError> {
        let secs = match start {
            Some(secs) if secs != 0 => secs,
            _ => return Err(RequestError::task("start", "must be provided")),
        };

        let start = epoch_to_local(secs)
            .ok_or_else(|| RequestError::task("start", "must be a valid epoch time"))?;
        if start <= now {
            return Err(RequestError::task("start", "must be in the future"));
        }
        Ok(start)
    }

    fn validate_commands(commands: &[String]) -> Result<(), RequestError> {
        if commands.is_empty() {
            return Err(RequestError::task("commands", "must not be empty"));
        }
        if commands.iter().any(|c| c.trim().is_empty()) {
            return Err(RequestError::task(
                "commands",
                "must not contain blank entries",
            ));
        }
        Ok(())
    }

    fn validate_timeout(timeout: u64) -> Result<Duration, RequestError> {
        if timeout == 0 {
            return Err(RequestError::task("timeout", "must be provided and non-zero"));
        }
        if timeout > MAX_TIMEOUT_SECS {
            return Err(RequestError::task(
                "timeout",
                format!("must be at most {} seconds", MAX_TIMEOUT_SECS),
            ));
        }
        Ok(Duration::from_secs(timeout))
    }

    fn validate_end(
        end: Option<i64>,
        start: DateTime<Local>,
    ) -> Result<Option<DateTime<Local>>, RequestError> {
        let secs = match end {
            Some(secs) if secs != 0 => secs,
            _ => return Ok(None),
        };

        let end = epoch_to_local(secs)
            .ok_or_else(|| RequestError::task("end", "must be a valid epoch time"))?;
        if end <= start {
            return Err(RequestError::task("end", "must be after start time"));
        }
        Ok(Some(end))
    }

    fn validate_recovery(
        recovery: &str,
        value: Option<&str>,
    ) -> Result<RecoveryPolicy, RequestError> {
        let policy = RecoveryPolicy::from_name(recovery).ok_or_else(|| {
            RequestError::task("recovery", format!("invalid action specified: {}", recovery))
        })?;

        if policy == RecoveryPolicy::RerunTaskDelay {
            let value = value.unwrap_or_default();
            if parse_delay(value).is_none() {
                return Err(RequestError::task(
                    "recovery_value",
                    format!("invalid delay specified: {}", value),
                ));
            }
        }
        Ok(policy)
    }
}

fn epoch_to_local(secs: i64) -> Option<DateTime<Local>> {
    Local.timestamp_opt(secs, 0).single()
}
