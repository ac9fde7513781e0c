//! smokerun configuration.
//!
//! Provides configuration file support via `smokerun.toml`, environment
//! variables, and command-line overrides. The resolved [`SmokeConfig`] is
//! immutable for the rest of the session and is passed explicitly into every
//! component.
//!
//! # Priority (highest to lowest)
//!
//! 1. Command-line flags
//! 2. Environment variables (`SMOKERUN_<SECTION>__<KEY>`)
//! 3. Configuration file (`smokerun.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::poll::PollConfig;

/// Mechanism implied by [`AuthMode::Legacy`].
pub const LEGACY_AUTH_MECHANISM: &str = "MONGODB-CR";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },
}

/// Oplog sizing and replication topology for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OplogMode {
    /// Standalone server, default oplog.
    #[default]
    Default,
    /// Small oplog with a master/slave pair.
    MasterSlave,
    /// Small oplog with a two-member replica set.
    ReplicaSet,
}

impl OplogMode {
    /// Returns true when a secondary is started next to the primary.
    #[must_use]
    pub fn is_replicated(&self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// Authentication mode for launched servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication.
    #[default]
    None,
    /// Authentication with the server's legacy default mechanism.
    Legacy,
    /// Authentication restricted to a named mechanism.
    Mechanism(String),
}

impl AuthMode {
    /// Builds the mode from the `--auth` / `--authMechanism` flag pair.
    #[must_use]
    pub fn from_flags(auth: bool, mechanism: &str) -> Self {
        if !auth {
            Self::None
        } else if mechanism.is_empty() || mechanism == LEGACY_AUTH_MECHANISM {
            Self::Legacy
        } else {
            Self::Mechanism(mechanism.to_string())
        }
    }

    /// Returns true when authentication is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Mechanism name handed to clients, if auth is on.
    #[must_use]
    pub fn mechanism(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Legacy => Some(LEGACY_AUTH_MECHANISM),
            Self::Mechanism(name) => Some(name),
        }
    }
}

/// Options every server launch is built from.
///
/// Snapshotted into the failure ledger so a retried test runs under the exact
/// configuration it failed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Port of the primary; a secondary binds `port + 1`.
    pub port: u16,
    /// Prefix for all data directories (empty = current directory).
    pub db_prefix: PathBuf,
    /// Journaling on/off.
    pub journal: bool,
    /// Journal preallocation on/off.
    pub prealloc_journal: bool,
    /// Replication topology / oplog sizing.
    pub oplog: OplogMode,
    /// Authentication mode.
    pub auth: AuthMode,
    /// TLS on normal ports.
    pub tls: bool,
    /// Extra raw server flags.
    pub extra_flags: Vec<String>,
    /// Server log file (`None` = inherit stdout).
    pub server_log: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 27999,
            db_prefix: PathBuf::new(),
            journal: true,
            prealloc_journal: true,
            oplog: OplogMode::Default,
            auth: AuthMode::None,
            tls: false,
            extra_flags: Vec::new(),
            server_log: None,
        }
    }
}

/// Executable and file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Database server executable.
    pub server_executable: PathBuf,
    /// Shell interpreter used for script tests and server commands.
    pub shell_executable: PathBuf,
    /// Directory test binaries are resolved against.
    pub test_path: Option<PathBuf>,
    /// Repository root that suite globs are expanded under.
    pub repo_root: PathBuf,
    /// Failure ledger file.
    pub failfile: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            server_executable: PathBuf::from("./mongod"),
            shell_executable: PathBuf::from("./mongo"),
            test_path: None,
            repo_root: PathBuf::from("."),
            failfile: PathBuf::from("failfile.smoke"),
        }
    }
}

/// How positional arguments are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Arguments name suites.
    #[default]
    Suite,
    /// Arguments are test file paths.
    Files,
}

/// Test-loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Keep going after a failing test.
    pub continue_on_failure: bool,
    /// Start a server before the first test.
    pub start_server: bool,
    /// Argument interpretation.
    pub mode: RunMode,
    /// Arguments are literal command lines (files mode with `--from-file`).
    pub raw_commands: bool,
    /// TAP-style summary on stdout, details to the tests log.
    pub quiet: bool,
    /// Shuffle instead of sorting.
    pub shuffle: bool,
    /// Skip tests sorting before this file name.
    pub skip_until: Option<String>,
    /// Drop tests whose path contains this pattern.
    pub ignore: Option<String>,
    /// Key file for auth-enabled replica-set and sharding tests.
    pub key_file: Option<PathBuf>,
    /// Where verbose test output goes (`None` = stdout).
    pub tests_log: Option<PathBuf>,
    /// Scheduled primary restart period, in tests.
    pub restart_every: usize,
    /// Readiness and replication polling budget.
    pub startup_attempts: u32,
    /// Interval between polls, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            start_server: true,
            mode: RunMode::Suite,
            raw_commands: false,
            quiet: false,
            shuffle: false,
            skip_until: None,
            ignore: None,
            key_file: None,
            tests_log: None,
            restart_every: 20,
            startup_attempts: 300,
            poll_interval_ms: 1000,
        }
    }
}

/// Main smokerun configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SmokeConfig {
    /// Server launch options.
    pub server: ServerOptions,
    /// Executable and file locations.
    pub paths: PathsConfig,
    /// Test-loop behavior.
    pub run: RunConfig,
}

impl SmokeConfig {
    /// Loads configuration from `smokerun.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("smokerun.toml")
    }

    /// Loads configuration from a specific file path.
    ///
    /// Priority: defaults < file < environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMOKERUN_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Creates a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        if self.server.oplog.is_replicated() && self.server.port == u16::MAX {
            return Err(ConfigError::InvalidValue {
                key: "server.port".to_string(),
                message: "no room for the secondary on port + 1".to_string(),
            });
        }

        if let AuthMode::Mechanism(name) = &self.server.auth {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "server.auth".to_string(),
                    message: "mechanism name cannot be empty".to_string(),
                });
            }
        }

        if self.run.restart_every == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.restart_every".to_string(),
                message: "value must be >= 1".to_string(),
            });
        }

        if self.run.startup_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "run.startup_attempts".to_string(),
                message: "value must be >= 1".to_string(),
            });
        }

        Ok(())
    }

    /// Polling budget for readiness and replication waits.
    #[must_use]
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            max_attempts: self.run.startup_attempts,
            interval: Duration::from_millis(self.run.poll_interval_ms),
        }
    }

    /// Returns a copy of this configuration running under other server options.
    #[must_use]
    pub fn with_server_options(&self, server: ServerOptions) -> Self {
        Self {
            server,
            ..self.clone()
        }
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
