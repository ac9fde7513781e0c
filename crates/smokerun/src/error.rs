//! Error types for smokerun.
//!
//! Test-level failures are not errors: they are [`RunOutcome`](crate::runner::RunOutcome)
//! values inspected by the sequencer. The variants here cover conditions that
//! stop the harness itself or that are absorbed with a log line.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for smokerun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a test run.
///
/// Error codes follow the pattern `SMOKE-XXX`.
#[derive(Error, Debug)]
pub enum Error {
    /// The server never became reachable (SMOKE-001).
    #[error("[SMOKE-001] Failed to start server on port {port}: not reachable after {attempts} attempts")]
    Launch {
        /// Port the server was told to bind.
        port: u16,
        /// Number of readiness probes made.
        attempts: u32,
    },

    /// A bounded poll ran out of attempts (SMOKE-002).
    #[error("[SMOKE-002] {operation} did not complete after {attempts} attempts")]
    PollTimeout {
        /// Human-readable name of the polled operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A server command returned an error (SMOKE-003).
    #[error("[SMOKE-003] Server command '{command}' failed: {message}")]
    Command {
        /// Logical command name.
        command: String,
        /// Error message reported by the server or shell.
        message: String,
    },

    /// Could not spawn a child process (SMOKE-004).
    #[error("[SMOKE-004] Failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The failure ledger file could not be decoded (SMOKE-005).
    ///
    /// Never surfaces to the user: loading treats it as an empty ledger.
    #[error("[SMOKE-005] Failure ledger {path:?} is corrupt: {message}")]
    LedgerCorrupt {
        /// Ledger file path.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// Configuration error (SMOKE-006).
    #[error("[SMOKE-006] Configuration error: {0}")]
    Config(String),

    /// Unknown test suite name (SMOKE-007).
    #[error("[SMOKE-007] Unknown test suite '{0}'")]
    UnknownSuite(String),

    /// IO error (SMOKE-008).
    #[error("[SMOKE-008] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (SMOKE-009).
    #[error("[SMOKE-009] Serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violated by the harness itself (SMOKE-010).
    #[error("[SMOKE-010] Bug in smokerun: {0}")]
    Bug(String),
}

impl Error {
    /// Returns the error code (e.g., "SMOKE-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "SMOKE-001",
            Self::PollTimeout { .. } => "SMOKE-002",
            Self::Command { .. } => "SMOKE-003",
            Self::Spawn { .. } => "SMOKE-004",
            Self::LedgerCorrupt { .. } => "SMOKE-005",
            Self::Config(_) => "SMOKE-006",
            Self::UnknownSuite(_) => "SMOKE-007",
            Self::Io(_) => "SMOKE-008",
            Self::Serialization(_) => "SMOKE-009",
            Self::Bug(_) => "SMOKE-010",
        }
    }

    /// Process exit code used when this error ends the run.
    ///
    /// A server that never came up aborts the run like a dead server does.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Launch { .. } => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let launch = Error::Launch {
            port: 27999,
            attempts: 300,
        };
        assert_eq!(launch.code(), "SMOKE-001");
        assert_eq!(Error::Bug("x".into()).code(), "SMOKE-010");
        assert_eq!(Error::UnknownSuite("nope".into()).code(), "SMOKE-007");
    }

    #[test]
    fn test_launch_failure_exits_with_server_code() {
        let launch = Error::Launch {
            port: 27999,
            attempts: 3,
        };
        assert_eq!(launch.exit_code(), 2);
        assert_eq!(Error::Config("bad".into()).exit_code(), 1);
    }

    #[test]
    fn test_error_display_includes_code() {
        let err = Error::Command {
            command: "dbhash".into(),
            message: "unauthorized".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[SMOKE-003]"));
        assert!(msg.contains("dbhash"));
        assert!(msg.contains("unauthorized"));
    }
}
