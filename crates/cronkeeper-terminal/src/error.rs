//! Error types for the cronkeeper-terminal crate.

use thiserror::Error;

/// All errors that can originate from command execution.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// The child process could not be spawned.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Underlying I/O failure while collecting output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The command outlived its deadline and its process group was killed.
    #[error("command timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The command line was empty or whitespace only.
    #[error("empty command")]
    EmptyCommand,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TerminalError>;
