//! # cadence-task
//!
//! Task scheduling core for Cadence.
//! Validates task requests, keeps the pending and today collections, releases
//! tasks at their start time and drives each run through its recovery policy.
//!
//! ## Features
//!
//! - Request validation with field-level errors
//! - Registry of pending and today's tasks with day rollover
//! - Single-loop dispatcher with a deadline heap and best-effort cancellation
//! - Local execution of ordered command sequences under one wall-clock budget
//! - Recovery policies: rerun, rerun failed, delayed rerun, zone hand-off, batch
//! - Optional record persistence for finished tasks

pub mod context;
pub mod control;
pub mod dispatcher;
pub mod executor;
pub mod persist;
pub mod recovery;
pub mod registry;
pub mod request;
pub mod state;
pub mod task;
pub mod zone;

// Service
pub use context::{Cadence, CadenceBuilder, SubmitError};
pub use control::{CancelRequest, CommandRequest, Directive, Request, Response};

// Scheduling
pub use dispatcher::{Dispatcher, DispatcherCommand, DispatcherHandle, Launcher};
pub use registry::{DependencyStatus, TaskRegistry};
pub use request::{
    NewTaskRequest, RequestError, TestRequest, ValidationContext, DEFAULT_RETRIES, MAX_TIMEOUT_SECS,
};

// Task model
pub use state::TaskState;
pub use task::{parse_delay, RecoveryPolicy, SharedTask, Task, TaskId, Test, TestMethod};

// Execution and recovery
pub use executor::{
    CommandOutcome, CommandStatus, Executor, FailureKind, LocalExecutor, LocalExecutorConfig,
    RunReport,
};
pub use persist::{task_record, MemorySink, RecordSink};
pub use recovery::{plan, RecoveryPlan, TaskRunner};
pub use zone::{DetachedZone, ZoneCoordinator};
