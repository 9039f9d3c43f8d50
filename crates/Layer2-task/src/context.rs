//! Service context - everything a running scheduler owns
//!
//! [`Cadence`] is built once and shared as `Arc<Cadence>`. It wires the
//! registry, dispatcher, runner, executor and collaborators together and is
//! the only entry point the control channel talks to.

use crate::control::{Directive, Request, Response};
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::executor::{Executor, LocalExecutor};
use crate::persist::RecordSink;
use crate::recovery::TaskRunner;
use crate::registry::TaskRegistry;
use crate::request::{NewTaskRequest, RequestError, ValidationContext};
use crate::task::TaskId;
use crate::zone::{DetachedZone, ZoneCoordinator};
use cadence_foundation::{Conf, Error, IdGenerator, Result, UuidGenerator};
use chrono::{DateTime, Local, TimeZone};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a new-task request was not accepted
#[derive(Debug, ThisError)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] RequestError),

    #[error("ERROR: {0}")]
    Registry(#[from] Error),
}

impl From<SubmitError> for Response {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Invalid(e) => Response::Rejected(e),
            SubmitError::Registry(e) => Response::error(e),
        }
    }
}

/// Builder for [`Cadence`]
pub struct CadenceBuilder {
    conf: Conf,
    conf_path: Option<PathBuf>,
    ids: Option<Arc<dyn IdGenerator>>,
    executor: Option<Arc<dyn Executor>>,
    sink: Option<Arc<dyn RecordSink>>,
    zone: Option<Arc<dyn ZoneCoordinator>>,
}

impl CadenceBuilder {
    pub fn new(conf: Conf) -> Self {
        Self {
            conf,
            conf_path: None,
            ids: None,
            executor: None,
            sink: None,
            zone: None,
        }
    }

    /// File re-read on `RELOAD`
    pub fn conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf_path = Some(path.into());
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn zone(mut self, zone: Arc<dyn ZoneCoordinator>) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Start the dispatcher and rollover job; must run inside a Tokio runtime
    pub fn build(self) -> Result<Arc<Cadence>> {
        self.conf.validate()?;

        let registry = Arc::new(TaskRegistry::new());
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(LocalExecutor::new()));
        executor.set_environment(self.conf.environment.clone());
        let zone = self.zone.unwrap_or_else(|| Arc::new(DetachedZone));

        let mut runner = TaskRunner::new(
            self.conf.self_host.clone(),
            Arc::clone(&registry),
            Arc::clone(&executor),
            zone,
        );
        if let Some(sink) = self.sink {
            runner = runner.with_sink(sink);
        }

        let (dispatcher, handle) = Dispatcher::new(Arc::clone(&registry), Arc::new(runner));
        let background = vec![
            dispatcher.spawn(),
            tokio::spawn(roll_over_daily(Arc::clone(&registry))),
        ];

        let (directives_tx, directives_rx) = mpsc::unbounded_channel();

        info!(
            host = %self.conf.self_host,
            executor = executor.name(),
            "Scheduler started"
        );

        Ok(Arc::new(Cadence {
            conf: RwLock::new(Arc::new(self.conf)),
            conf_path: self.conf_path,
            registry,
            dispatcher: handle,
            ids: self.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            executor,
            directives_tx,
            directives_rx: Mutex::new(Some(directives_rx)),
            background: Mutex::new(background),
        }))
    }
}

/// The running scheduler
pub struct Cadence {
    conf: RwLock<Arc<Conf>>,
    conf_path: Option<PathBuf>,
    registry: Arc<TaskRegistry>,
    dispatcher: DispatcherHandle,
    ids: Arc<dyn IdGenerator>,
    executor: Arc<dyn Executor>,
    directives_tx: mpsc::UnboundedSender<Directive>,
    directives_rx: Mutex<Option<mpsc::UnboundedReceiver<Directive>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Cadence {
    pub fn builder(conf: Conf) -> CadenceBuilder {
        CadenceBuilder::new(conf)
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Conf> {
        Arc::clone(&self.conf.read())
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Receiver of directives from command requests; handed out once
    pub fn take_directives(&self) -> Option<mpsc::UnboundedReceiver<Directive>> {
        self.directives_rx.lock().take()
    }

    /// Decode and answer one control-channel line
    pub async fn handle_line(&self, line: &str) -> Response {
        match Request::decode(line) {
            Ok(request) => self.submit_request(request).await,
            Err(e) => {
                debug!("Malformed request: {}", e);
                Response::malformed(e)
            }
        }
    }

    pub async fn submit_request(&self, request: Request) -> Response {
        match request {
            Request::Command(command) => {
                let directive = Directive::from_cmd(&command.cmd);
                if directive == Directive::Unknown {
                    warn!(cmd = %command.cmd, "Unknown command");
                }
                if self.directives_tx.send(directive).is_err() {
                    warn!(directive = %directive, "No control loop is listening");
                }
                Response::Directive(directive)
            }
            Request::NewTask(request) => match self.submit(request) {
                Ok(id) => Response::NewTask(id),
                Err(e) => {
                    info!("Rejected task request: {}", e);
                    e.into()
                }
            },
            Request::CancelTask(request) => {
                let id = TaskId::new(request.id);
                match self.cancel(&id).await {
                    Ok(()) => Response::Cancelled(id),
                    Err(e) => Response::error(e),
                }
            }
        }
    }

    /// Validate a request and register the resulting task
    pub fn submit(&self, request: NewTaskRequest) -> std::result::Result<TaskId, SubmitError> {
        let is_known = |id: &TaskId| self.registry.is_known(id);
        let ctx = ValidationContext {
            now: Local::now(),
            ids: self.ids.as_ref(),
            is_known: &is_known,
        };

        let task = request.validate(&ctx)?;
        let id = task.id.clone();
        let start = task.start;
        self.registry.add(task.into_shared())?;

        info!(task_id = %id, start = %start, "Task accepted");
        Ok(id)
    }

    /// Cancel a task that has not started running
    pub async fn cancel(&self, id: &TaskId) -> Result<()> {
        self.dispatcher.cancel(id).await
    }

    /// Re-read the configuration file
    ///
    /// Environment and zone data apply to later runs; port and log file
    /// changes need a restart.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .conf_path
            .as_ref()
            .ok_or_else(|| Error::Config("No configuration file to reload".to_string()))?;
        let fresh = Conf::load(path)?;
        let current = self.config();

        if fresh.client_port != current.client_port || fresh.host_port != current.host_port {
            warn!("Port changes take effect after a restart");
        }
        if fresh.log_file != current.log_file {
            warn!("Log file changes take effect after a restart");
        }

        self.executor.set_environment(fresh.environment.clone());
        *self.conf.write() = Arc::new(fresh);

        info!(path = %path.display(), "Configuration reloaded");
        Ok(())
    }

    /// Stop dispatching; runs already released finish on their own
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        info!(
            pending = self.registry.pending_len(),
            "Scheduler stopped"
        );
    }
}

/// Sleep until each local midnight and roll the today set over
async fn roll_over_daily(registry: Arc<TaskRegistry>) {
    loop {
        let wait = until_next_midnight(Local::now());
        debug!(secs = wait.as_secs(), "Next day rollover scheduled");
        tokio::time::sleep(wait).await;

        // Woken a hair early by a clock adjustment: the date is still the old one
        let today = (Local::now() + chrono::Duration::seconds(1)).date_naive();
        registry.roll_over(today);
    }
}

fn until_next_midnight(now: DateTime<Local>) -> Duration {
    let midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|at| Local.from_local_datetime(&at).earliest());

    match midnight {
        Some(midnight) => (midnight - now).to_std().unwrap_or(Duration::from_secs(1)),
        None => Duration::from_secs(3600),
    }
}
