#![forbid(unsafe_code)]

//! `rtcr`: transparent checkpoint/restore supervisor.
//!
//! Interposes on every kernel session a child opens, keeps shadow
//! records of the objects the child creates, and periodically copies
//! the child's memory and capability layout into supervisor-owned
//! storage.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod kernel;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod workload;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
