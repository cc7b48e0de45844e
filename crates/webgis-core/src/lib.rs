//! Web GIS core - resource types, error taxonomy and configuration

pub mod config;
pub mod error;
pub mod types;

pub use config::{OrchestratorConfig, RetryConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use types::*;
