//! Executor trait

use crate::executor::RunReport;
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashMap;

/// Executor trait - implement to add new execution backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the task's remaining commands once, bounded by its timeout
    async fn execute(&self, task: &Task) -> RunReport;

    /// Replace the environment exported to executed commands
    fn set_environment(&self, _environment: HashMap<String, String>) {}

    /// Get executor name
    fn name(&self) -> &'static str;
}
