//! Shared data types for cronkeeper-terminal.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::truncate::DEFAULT_MAX_CHARS;

// ---------------------------------------------------------------------------
// ExecResult
// ---------------------------------------------------------------------------

/// Result returned by [`crate::exec`] when the child exits before its deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 = success). `-1` when killed by a signal.
    pub exit_code: i32,

    /// Captured standard output (ANSI escapes already stripped).
    pub stdout: String,

    /// Captured standard error (ANSI escapes already stripped).
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, each trimmed, separated by a newline when
    /// both are present.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim_end();
        let err = self.stderr.trim_end();
        match (out.is_empty(), err.is_empty()) {
            (_, true) => out.to_string(),
            (true, false) => err.to_string(),
            (false, false) => format!("{out}\n{err}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecOptions
// ---------------------------------------------------------------------------

/// Configuration knobs for one-shot command execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Deadline for the whole child process group.
    pub timeout: Duration,

    /// Maximum characters kept per stream before middle-omission truncation.
    pub max_output_chars: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stdout: &str, stderr: &str) -> ExecResult {
        ExecResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn combined_joins_both_streams() {
        assert_eq!(result("out\n", "err\n").combined(), "out\nerr");
    }

    #[test]
    fn combined_skips_empty_streams() {
        assert_eq!(result("only out\n", "").combined(), "only out");
        assert_eq!(result("", "only err").combined(), "only err");
        assert_eq!(result("", "").combined(), "");
    }
}
