//! Record sinks - where finalized `persist` tasks are written

use crate::executor::RunReport;
use crate::task::Task;
use async_trait::async_trait;
use cadence_foundation::{Error, Result, Storage, TaskRecord};
use chrono::Local;
use parking_lot::Mutex;

/// Durable destination for final task records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn record(&self, record: TaskRecord) -> Result<()>;
}

#[async_trait]
impl RecordSink for Storage {
    /// SQLite writes block, so they run on the blocking pool
    async fn record(&self, record: TaskRecord) -> Result<()> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.save_record(&record))
            .await
            .map_err(|e| Error::Storage(format!("Record writer failed: {}", e)))?
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TaskRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.records.lock().clone()
    }

    pub fn find(&self, id: &str) -> Option<TaskRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn record(&self, record: TaskRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Build the final record of `task`, with the failure of its last run if any
pub fn task_record(task: &Task, last_run: Option<&RunReport>) -> TaskRecord {
    TaskRecord {
        id: task.id.to_string(),
        state: task.state.name().to_string(),
        start: task.start,
        end: task.end,
        retries: task.retries,
        exec_host: task.exec_host.clone(),
        failure: last_run.and_then(|report| report.failure_summary(task.state)),
        finished_at: task.completed_at.unwrap_or_else(Local::now),
    }
}
