//! Storage module for Cadence
//!
//! - `db`: SQLite - records of finished `persist` tasks

mod db;

pub use db::{Storage, TaskRecord};
