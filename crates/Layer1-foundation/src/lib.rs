//! # cadence-foundation
//!
//! Foundation layer for Cadence:
//! - Error: shared error type and `Result` alias
//! - Config: daemon configuration (`Conf`, `Zone`) loaded from TOML
//! - Id: unique task identifier generation
//! - Storage: SQLite record store for finished tasks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  cadenced (Layer3-daemon)                    │
//! │   control listener ──► directive loop        │
//! │            │                                 │
//! │            ▼                                 │
//! │  cadence-task (Layer2)                       │
//! │   validator ► registry ► dispatcher ► runner │
//! │            │                                 │
//! │            ▼                                 │
//! │  cadence-foundation (Layer1)                 │
//! │   Conf / Error / IdGenerator / Storage       │
//! └──────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    Conf, Zone, CONF_FILE, DEFAULT_CLIENT_PORT, DEFAULT_HOST_PORT, DEFAULT_LOG_FILE,
    DEFAULT_RECORDS_FILE, DEFAULT_SELF,
};

// ============================================================================
// Identifiers
// ============================================================================
pub use id::{IdGenerator, UuidGenerator};

// ============================================================================
// Storage
// ============================================================================
pub use storage::{Storage, TaskRecord};
