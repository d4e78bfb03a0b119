//! Shared configuration and error types for the Hookline workspace.

pub mod config;
pub mod error;

pub use config::HooklineConfig;
pub use error::{HooklineError, Result};
