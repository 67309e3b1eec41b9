//! # taskd core
//!
//! Configuration and error types shared by the scheduler crate and the CLI.

pub mod config;
pub mod error;

pub use config::{BackoffConfig, ExecutorConfig, NotifyConfig, TaskdConfig};
pub use error::{Result, TaskdError};
