//! Control channel messages
//!
//! One JSON request per line, externally tagged:
//!
//! ```text
//! {"command":{"cmd":"SHUTDOWN"}}
//! {"new_task":{"start":1475437451,"commands":["echo ok"],"timeout":75}}
//! {"cancel_task":{"id":"..."}}
//! ```
//!
//! Every request gets exactly one response line.

use crate::request::{NewTaskRequest, RequestError};
use crate::task::TaskId;
use serde::{Deserialize, Serialize};

/// Instruction for the daemon's own control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    ReloadConfig,
    Shutdown,
    Unknown,
}

impl Directive {
    /// Map a command name; names are case-sensitive
    pub fn from_cmd(cmd: &str) -> Self {
        match cmd {
            "SHUTDOWN" => Directive::Shutdown,
            "RELOAD" => Directive::ReloadConfig,
            _ => Directive::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Directive::ReloadConfig => "RELOAD_CONFIG",
            Directive::Shutdown => "SHUTDOWN",
            Directive::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    pub cmd: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub id: String,
}

/// A decoded client message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Command(CommandRequest),
    NewTask(NewTaskRequest),
    CancelTask(CancelRequest),
}

impl Request {
    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

/// The single line answered to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    NewTask(TaskId),
    Directive(Directive),
    Cancelled(TaskId),
    Rejected(RequestError),
    Error(String),
}

impl Response {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error(message.to_string())
    }

    pub fn malformed(detail: impl std::fmt::Display) -> Self {
        Response::Error(format!("malformed request: {}", detail))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Rejected(_) | Response::Error(_))
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::NewTask(id) => write!(f, "New Task ID: {}", id),
            Response::Directive(directive) => write!(f, "Directive: {}", directive),
            Response::Cancelled(id) => write!(f, "Cancelled Task ID: {}", id),
            Response::Rejected(e) => write!(f, "{}", e),
            Response::Error(message) => write!(f, "ERROR: {}", message),
        }
    }
}
