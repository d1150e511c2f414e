//! Shared configuration and error types for every cronkeeper crate.

pub mod config;
pub mod error;

pub use config::CronkeeperConfig;
pub use error::{CoreError, Result};
