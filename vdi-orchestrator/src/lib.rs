//! Workspace provisioning orchestrator.
//!
//! Tracks virtual desktops in SQLite, provisions them through cloud
//! adapters, and walks each one through its lifecycle with bounded retry
//! and monitoring. See [`service::WorkspaceService`] for the request-level
//! API and [`engine::Engine`] for the provisioning loops.

pub mod applications;
pub mod catalog;
pub mod config;
pub mod credential;
pub mod db;
pub mod engine;
pub mod error;
pub mod operation;
pub mod service;
pub mod test_utils;
pub mod workspace;

pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use service::WorkspaceService;
