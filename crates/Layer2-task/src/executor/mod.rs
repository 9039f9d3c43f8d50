//! Task executors
//!
//! - `LocalExecutor` - runs each command through `sh -c` on this host
//! - `RunReport` - per-command outcomes of one run and the verdict over them

pub mod local;
pub mod report;
pub mod r#trait;

pub use local::{LocalExecutor, LocalExecutorConfig};
pub use r#trait::Executor;
pub use report::{CommandOutcome, CommandStatus, FailureKind, RunReport};
