//! Zone coordination - hand a task to another host of the zone
//!
//! Host selection and leased execution live outside this crate. The
//! scheduler only needs the two calls below; [`DetachedZone`] is used when no
//! coordinator is configured and refuses both.

use crate::task::Task;
use async_trait::async_trait;
use cadence_foundation::{Error, Result};

/// Host selection and leased execution for the local zone
#[async_trait]
pub trait ZoneCoordinator: Send + Sync {
    /// Run `task` on another host, `preferred` if given; returns the host that took it
    async fn run_elsewhere(&self, task: &Task, preferred: Option<&str>) -> Result<String>;

    /// Queue `task` for deferred batch execution on `queue`
    async fn enqueue_batch(&self, task: &Task, queue: Option<&str>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Coordinator for a host that is alone in its zone
#[derive(Debug, Default, Clone)]
pub struct DetachedZone;

#[async_trait]
impl ZoneCoordinator for DetachedZone {
    async fn run_elsewhere(&self, task: &Task, _preferred: Option<&str>) -> Result<String> {
        Err(Error::Zone(format!(
            "no zone coordinator available to move task {}",
            task.id
        )))
    }

    async fn enqueue_batch(&self, task: &Task, _queue: Option<&str>) -> Result<()> {
        Err(Error::Zone(format!(
            "no batch queue available for task {}",
            task.id
        )))
    }

    fn name(&self) -> &'static str {
        "detached"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[tokio::test]
    async fn test_detached_zone_refuses() {
        let zone = DetachedZone;
        let task = Task::new("z", Local::now(), vec!["true".into()]);

        let err = zone.run_elsewhere(&task, Some("peer-1")).await.unwrap_err();
        assert!(matches!(err, Error::Zone(_)));

        tokio_test::assert_err!(zone.enqueue_batch(&task, None).await);
        assert_eq!(zone.name(), "detached");
    }
}
