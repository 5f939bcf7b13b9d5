//! Shared foundation for the VDI orchestrator workspace.
//!
//! Holds the error type used across crates, the cloud-provider vocabulary,
//! tracing initialization and secret-masking helpers.

pub mod error;
pub mod logging;
pub mod mask;
pub mod types;

pub use error::{Result, VdiError};
pub use types::{CloudProvider, DesktopOs};
