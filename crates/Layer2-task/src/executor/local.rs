//! Local executor - runs a task's commands on this host
//!
//! Features:
//! - Each command runs through `sh -c` in its own process group
//! - Sequence stops at the first command that does not exit 0
//! - One deadline covers the whole run; on expiry the running command's
//!   process group is killed
//! - Zone environment exported to every command

use crate::executor::{CommandOutcome, CommandStatus, Executor, FailureKind, RunReport};
use crate::task::Task;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Deadline used when a timeout does not fit in an `Instant`
const FAR_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Local executor configuration
#[derive(Debug, Clone)]
pub struct LocalExecutorConfig {
    pub shell: String,
    pub shell_arg: String,
    /// Start each command as the leader of a new process group (Unix only)
    pub kill_process_group: bool,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            shell_arg: "-c".to_string(),
            kill_process_group: true,
        }
    }
}

/// Local executor
pub struct LocalExecutor {
    config: LocalExecutorConfig,
    environment: RwLock<HashMap<String, String>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::with_config(LocalExecutorConfig::default())
    }

    pub fn with_config(config: LocalExecutorConfig) -> Self {
        Self {
            config,
            environment: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_environment(self, environment: HashMap<String, String>) -> Self {
        *self.environment.write() = environment;
        self
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg(&self.config.shell_arg)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Parent environment is inherited; zone variables override it
        for (key, value) in self.environment.read().iter() {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        if self.config.kill_process_group {
            cmd.process_group(0);
        }

        cmd
    }

    async fn run_command(&self, index: usize, command: &str, deadline: Instant) -> CommandOutcome {
        let started = Instant::now();
        let outcome = |status: CommandStatus, stdout: String, stderr: String| CommandOutcome {
            index,
            command: command.to_string(),
            status,
            stdout,
            stderr,
            duration: started.elapsed(),
        };

        if started >= deadline {
            return outcome(CommandStatus::TimedOut, String::new(), String::new());
        }

        let child = match self.build_command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                let kind = classify_spawn_error(&e);
                warn!(index, command, kind = kind.name(), "Failed to spawn command: {}", e);
                return outcome(
                    CommandStatus::SpawnFailed {
                        kind,
                        message: format!("failed to spawn: {}", e),
                    },
                    String::new(),
                    String::new(),
                );
            }
        };
        let pid = child.id();

        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                outcome(exit_status(&output.status), stdout, stderr)
            }
            Ok(Err(e)) => outcome(
                CommandStatus::SpawnFailed {
                    kind: FailureKind::Transient,
                    message: format!("failed to collect output: {}", e),
                },
                String::new(),
                String::new(),
            ),
            Err(_) => {
                // Dropping the wait future kills the shell; the group takes its children
                if let Some(pid) = pid {
                    if self.config.kill_process_group {
                        kill_process_group(pid);
                    }
                }
                outcome(CommandStatus::TimedOut, String::new(), String::new())
            }
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, task: &Task) -> RunReport {
        let started = Instant::now();
        let deadline = started
            .checked_add(task.timeout)
            .unwrap_or_else(|| started + FAR_DEADLINE);
        let mut outcomes = Vec::new();

        for (index, command) in task.remaining_commands() {
            info!(task_id = %task.id, index, "Executing command: {}", command);

            let outcome = self.run_command(index, command, deadline).await;
            debug!(
                task_id = %task.id,
                index,
                status = ?outcome.status,
                elapsed_ms = outcome.duration.as_millis() as u64,
                "Command finished"
            );

            let stop = !outcome.succeeded();
            outcomes.push(outcome);
            if stop {
                break;
            }
        }

        RunReport {
            outcomes,
            duration: started.elapsed(),
        }
    }

    fn set_environment(&self, environment: HashMap<String, String>) {
        *self.environment.write() = environment;
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn classify_spawn_error(e: &std::io::Error) -> FailureKind {
    match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => FailureKind::HostFatal,
        _ => FailureKind::Transient,
    }
}

fn exit_status(status: &std::process::ExitStatus) -> CommandStatus {
    if let Some(code) = status.code() {
        return CommandStatus::Exited(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return CommandStatus::Signalled(signal);
        }
    }

    CommandStatus::Signalled(0)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // Negative pid addresses the whole group led by `pid`
    let result = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if result != 0 {
        debug!(pid, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::TaskState;
    use crate::task::{Test, TestMethod};
    use chrono::Local;

    const SHORT: Duration = Duration::from_millis(300);

    fn task(commands: &[&str]) -> Task {
        Task::new(
            "local-test",
            Local::now(),
            commands.iter().map(|c| c.to_string()).collect(),
        )
        .with_timeout(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_local_executor() {
        let executor = LocalExecutor::new();
        assert_eq!(executor.name(), "local");
    }

    #[tokio::test]
    async fn test_execute_sequence_concatenates_output() {
        let executor = LocalExecutor::new();
        let task = task(&["echo one", "echo two"]);

        let report = executor.execute(&task).await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.stdout(), "one\ntwo\n");
        assert_eq!(report.exit_code(), Some(0));
        assert_eq!(report.verdict(&task), TaskState::Successful);
    }

    #[tokio::test]
    async fn test_sequence_stops_at_first_failure() {
        let executor = LocalExecutor::new();
        let task = task(&["echo before", "exit 3", "echo after"]);

        let report = executor.execute(&task).await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.exit_code(), Some(3));
        assert_eq!(report.first_failure().unwrap().index, 1);
        assert!(!report.stdout().contains("after"));
        assert_eq!(report.verdict(&task), TaskState::FailedTest);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_runs() {
        let executor = LocalExecutor::new();
        let task = task(&["echo ok"]).with_timeout(Duration::MAX);

        let report = executor.execute(&task).await;
        assert_eq!(report.stdout(), "ok\n");
        assert_eq!(report.verdict(&task), TaskState::Successful);
    }

    #[tokio::test]
    async fn test_resume_from_skips_earlier_commands() {
        let executor = LocalExecutor::new();
        let mut task = task(&["echo first", "echo second"]);
        task.resume_from = 1;

        let report = executor.execute(&task).await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].index, 1);
        assert_eq!(report.stdout(), "second\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let executor = LocalExecutor::new();
        let task = task(&["sleep 5", "echo never"]).with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let report = executor.execute(&task).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(report.timed_out());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.verdict(&task), TaskState::FailedTimeout);
    }

    #[tokio::test]
    async fn test_timeout_reaches_background_children() {
        let executor = LocalExecutor::new();
        let task = task(&["sleep 5 & wait"]).with_timeout(SHORT);

        let started = std::time::Instant::now();
        let report = executor.execute(&task).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(report.timed_out());
    }

    #[tokio::test]
    async fn test_environment_exported() {
        let executor = LocalExecutor::new().with_environment(HashMap::from([(
            "CADENCE_ZONE".to_string(),
            "east".to_string(),
        )]));
        let task = task(&["echo $CADENCE_ZONE"]);

        let report = executor.execute(&task).await;
        assert_eq!(report.stdout(), "east\n");

        executor.set_environment(HashMap::new());
        let report = executor.execute(&task).await;
        assert_eq!(report.stdout(), "\n");
    }

    #[tokio::test]
    async fn test_missing_command_is_host_fatal() {
        let executor = LocalExecutor::new();
        let task = task(&["definitely-not-a-real-command-xyz"]);

        let report = executor.execute(&task).await;
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.failure_kind(), Some(FailureKind::HostFatal));
        assert_eq!(report.verdict(&task), TaskState::FailedTest);
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_failure() {
        let executor = LocalExecutor::with_config(LocalExecutorConfig {
            shell: "/nonexistent/shell".to_string(),
            ..Default::default()
        });
        let task = task(&["echo hi"]);

        let report = executor.execute(&task).await;
        assert!(matches!(
            report.outcomes[0].status,
            CommandStatus::SpawnFailed {
                kind: FailureKind::HostFatal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exit_code_test_accepts_failure() {
        let executor = LocalExecutor::new();
        let task = task(&["exit 4"]).with_tests(vec![Test::new(TestMethod::ExitCode, "4")]);

        let report = executor.execute(&task).await;
        assert_eq!(report.verdict(&task), TaskState::Successful);
    }
}
