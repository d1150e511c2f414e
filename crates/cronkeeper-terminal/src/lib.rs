//! cronkeeper-terminal: deadline-bounded shell execution.
//!
//! [`exec::exec`] runs a command line through the platform shell in its own
//! process group, captures stdout/stderr, and kills the whole group when the
//! deadline expires.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cronkeeper_terminal::{exec, ExecOptions};
//!
//! # async fn demo() -> cronkeeper_terminal::Result<()> {
//! let result = exec("echo hello", &ExecOptions::with_timeout(Duration::from_secs(5))).await?;
//! assert_eq!(result.stdout.trim(), "hello");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod exec;
pub mod truncate;
pub mod types;

pub use error::{Result, TerminalError};
pub use exec::exec;
pub use types::{ExecOptions, ExecResult};
