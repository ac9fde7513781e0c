//! Wiring of one harness invocation.
//!
//! A [`Session`] owns the resolved configuration and builds the real
//! components from it: shell-backed command channel, managed (or null)
//! servers, the process-launching test runner and the sequencer.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AuthMode, RunMode, SmokeConfig};
use crate::error::{Error, Result};
use crate::ledger::{FailureLedger, RetrySummary};
use crate::runner::{default_key_file, TestRunner};
use crate::sequencer::{SuiteResult, SuiteSequencer};
use crate::server::{args, ManagedServer, NullServer, ServerControl};
use crate::shell::{CommandChannel, ShellChannel};
use crate::suite::{self, executable_name, TestUnit};

/// Applies the session-wide rules that depend on what is being run.
///
/// - the `client` suite always runs without authentication;
/// - auth without a key file uses the repository's test key;
/// - quiet mode sends test and server output to files under the prefix.
#[must_use]
pub fn finalize_config(mut config: SmokeConfig, args: &[String]) -> SmokeConfig {
    if config.run.mode == RunMode::Suite && args.len() == 1 && args[0] == "client" {
        if config.server.auth.is_enabled() {
            info!("not running client suite with auth even though auth was requested");
        }
        config.server.auth = AuthMode::None;
        config.run.key_file = None;
    }

    if config.server.auth.is_enabled() && config.run.key_file.is_none() {
        config.run.key_file = Some(default_key_file(&config.paths.repo_root));
    }

    if config.run.quiet {
        let prefix = &config.server.db_prefix;
        if config.run.tests_log.is_none() {
            config.run.tests_log = Some(prefix.join("tests.log"));
        }
        if config.server.server_log.is_none() {
            config.server.server_log = Some(prefix.join("server.log"));
        }
    }

    config
}

/// One harness invocation.
#[derive(Debug, Clone)]
pub struct Session {
    config: SmokeConfig,
}

impl Session {
    /// Creates a session over an already finalized configuration.
    pub fn new(config: SmokeConfig) -> Self {
        Self { config }
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SmokeConfig {
        &self.config
    }

    /// Turns positional arguments into the ordered list of tests to run.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown suite or an unreadable path.
    pub fn resolve_units(&self, arguments: &[String]) -> Result<Vec<TestUnit>> {
        let run = &self.config.run;
        let paths = &self.config.paths;

        let mut units = match (run.mode, run.raw_commands) {
            (RunMode::Suite, _) => {
                suite::expand_suites(arguments, &paths.repo_root, paths.test_path.as_deref())?
            }
            (RunMode::Files, true) => suite::units_from_commands(arguments),
            (RunMode::Files, false) => suite::units_from_files(arguments)?,
        };

        if let Some(pattern) = &run.ignore {
            units = suite::ignore_matching(units, pattern)?;
        }
        if run.shuffle {
            suite::shuffle(&mut units);
        }
        if let Some(name) = run.skip_until.as_deref().filter(|n| !n.is_empty()) {
            units = suite::skip_until(units, name);
        }
        Ok(units)
    }

    /// Fails early when the server executable is missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a server must be started but its
    /// executable does not exist.
    pub fn check_executables(&self) -> Result<()> {
        if !self.config.run.start_server {
            return Ok(());
        }
        let server = &self.config.paths.server_executable;
        let name = executable_name(&server.display().to_string());
        if !std::path::Path::new(&name).exists() {
            return Err(Error::Config(format!("no server executable found at {name}")));
        }
        Ok(())
    }

    /// Removes data directories left by earlier runs.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the data root cannot be removed.
    pub fn clean_data(&self) -> Result<()> {
        info!("clearing {:?}", self.config.server.db_prefix.join("data").join("db"));
        args::clean_data_root(&self.config.server.db_prefix)?;
        Ok(())
    }

    /// Runs `units` with freshly built servers and runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the runner cannot be set up. Errors during the
    /// run itself are part of the result, like test failures.
    pub async fn run_suite(&self, units: &[TestUnit]) -> Result<SuiteResult> {
        let config = &self.config;
        let channel: Arc<dyn CommandChannel> = Arc::new(ShellChannel::new(
            config.paths.shell_executable.clone(),
            config.server.tls,
        ));

        let (primary, secondary): (Box<dyn ServerControl>, Option<Box<dyn ServerControl>>) =
            if config.run.start_server {
                let secondary = config.server.oplog.is_replicated().then(|| {
                    Box::new(ManagedServer::secondary(config, Arc::clone(&channel)))
                        as Box<dyn ServerControl>
                });
                (
                    Box::new(ManagedServer::primary(config, Arc::clone(&channel))),
                    secondary,
                )
            } else {
                (Box::new(NullServer), None)
            };

        let runner = TestRunner::new(config.clone())?;
        Ok(SuiteSequencer::new(config.clone(), primary, secondary, Box::new(runner))
            .run(units)
            .await)
    }

    /// Replays the failure ledger, each entry under its own server options.
    ///
    /// The session-wide rules of [`finalize_config`] are applied again for
    /// every entry, since its options may differ from the session's.
    ///
    /// # Errors
    ///
    /// Returns the first harness error hit during a replay.
    pub async fn retry_failures(&self, ledger: &FailureLedger) -> Result<RetrySummary> {
        ledger
            .retry_only(|entry| {
                let mut config = self.config.with_server_options(entry.options);
                config.run.mode = RunMode::Files;
                config.run.raw_commands = false;
                let config = finalize_config(config, std::slice::from_ref(&entry.test.path));
                let session = Session::new(config);
                let unit = entry.test;
                async move {
                    info!("replaying {}", unit.path);
                    let mut result = session.run_suite(std::slice::from_ref(&unit)).await?;
                    if let Some(e) = result.error.take() {
                        return Err(e);
                    }
                    if result.replication_diverged() {
                        warn!("replication diverged while replaying {}", unit.path);
                    }
                    Ok(result.exit_code() == 0 && !result.ledger.succeeded.is_empty())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OplogMode;
    use crate::sequencer::SequencerState;
    use std::path::{Path, PathBuf};

    fn quiet_free_config() -> SmokeConfig {
        let mut config = SmokeConfig::default();
        config.run.start_server = false;
        config
    }

    #[test]
    fn test_client_suite_runs_without_auth() {
        let mut config = SmokeConfig::default();
        config.server.auth = AuthMode::Legacy;
        config.run.key_file = Some(PathBuf::from("key"));

        let config = finalize_config(config, &["client".to_string()]);

        assert_eq!(config.server.auth, AuthMode::None);
        assert!(config.run.key_file.is_none());
    }

    #[test]
    fn test_auth_gets_default_key_file() {
        let mut config = SmokeConfig::default();
        config.server.auth = AuthMode::Legacy;
        config.paths.repo_root = PathBuf::from("/repo");

        let config = finalize_config(config, &["js".to_string()]);

        assert_eq!(
            config.run.key_file,
            Some(PathBuf::from("/repo/jstests/libs/authTestsKey"))
        );
    }

    #[test]
    fn test_quiet_mode_log_defaults() {
        let mut config = SmokeConfig::default();
        config.run.quiet = true;
        config.server.db_prefix = PathBuf::from("/smoke");

        let config = finalize_config(config, &[]);

        assert_eq!(config.run.tests_log, Some(PathBuf::from("/smoke/tests.log")));
        assert_eq!(config.server.server_log, Some(PathBuf::from("/smoke/server.log")));
    }

    #[test]
    fn test_explicit_logs_are_kept() {
        let mut config = SmokeConfig::default();
        config.run.quiet = true;
        config.run.tests_log = Some(PathBuf::from("t.log"));

        let config = finalize_config(config, &[]);

        assert_eq!(config.run.tests_log, Some(PathBuf::from("t.log")));
    }

    #[test]
    fn test_resolve_units_in_files_mode() {
        // Arrange
        let mut config = quiet_free_config();
        config.run.mode = RunMode::Files;
        config.run.ignore = Some("skipme".to_string());
        let session = Session::new(config);
        let args = vec![
            "/t/a.js".to_string(),
            "/t/skipme.js".to_string(),
            "/t/c.js".to_string(),
        ];

        // Act
        let units = session.resolve_units(&args).unwrap();

        // Assert
        let paths: Vec<&str> = units.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["/t/a.js", "/t/c.js"]);
        assert!(units.iter().all(|u| u.requires_server));
    }

    #[test]
    fn test_resolve_units_skip_until() {
        let mut config = quiet_free_config();
        config.run.mode = RunMode::Files;
        config.run.skip_until = Some("b.js".to_string());
        let session = Session::new(config);

        let units = session
            .resolve_units(&["/t/a.js".to_string(), "/t/b.js".to_string(), "/t/c.js".to_string()])
            .unwrap();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].path, "/t/b.js");
    }

    #[test]
    fn test_resolve_raw_commands_verbatim() {
        let mut config = quiet_free_config();
        config.run.mode = RunMode::Files;
        config.run.raw_commands = true;
        let session = Session::new(config);

        let units = session.resolve_units(&["sh -c 'exit 0'".to_string()]).unwrap();

        assert_eq!(units, vec![TestUnit::new("sh -c 'exit 0'", true)]);
    }

    #[test]
    fn test_unknown_suite_is_rejected() {
        let session = Session::new(quiet_free_config());

        let err = session.resolve_units(&["noSuchSuite".to_string()]).unwrap_err();

        assert!(matches!(err, Error::UnknownSuite(_)));
    }

    #[test]
    fn test_check_executables() {
        let mut config = SmokeConfig::default();
        config.paths.server_executable = PathBuf::from("/definitely/not/mongod");
        assert!(Session::new(config.clone()).check_executables().is_err());

        config.run.start_server = false;
        assert!(Session::new(config).check_executables().is_ok());
    }

    #[test]
    fn test_clean_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("data").join("db").join("sconsTests");
        std::fs::create_dir_all(&db).unwrap();
        let mut config = SmokeConfig::default();
        config.server.db_prefix = dir.path().to_path_buf();

        Session::new(config).clean_data().unwrap();

        assert!(!dir.path().join("data").join("db").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_suite_without_servers() {
        let mut config = quiet_free_config();
        config.run.mode = RunMode::Files;
        config.run.raw_commands = true;
        config.run.continue_on_failure = true;
        config.server.oplog = OplogMode::MasterSlave;
        let session = Session::new(config);
        let units = session
            .resolve_units(&["true".to_string(), "false".to_string()])
            .unwrap();

        let result = session.run_suite(&units).await.unwrap();

        assert_eq!(result.state, SequencerState::Completed);
        assert_eq!(result.ledger.succeeded.len(), 1);
        assert_eq!(result.ledger.failed.len(), 1);
        // No servers, so no replication check even in a replication mode
        assert!(result.replication.is_none());
        assert_eq!(result.exit_code(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retry_failures_replays_with_shell() {
        use std::os::unix::fs::PermissionsExt;

        // Arrange: a shell that passes every script except fails.js
        let dir = tempfile::tempdir().unwrap();
        let shell = dir.path().join("fake-shell");
        std::fs::write(
            &shell,
            "#!/bin/sh\nfor a in \"$@\"; do case \"$a\" in *fails.js) exit 7;; esac; done\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();
        let passes = dir.path().join("passes.js");
        let fails = dir.path().join("fails.js");
        std::fs::write(&passes, b"").unwrap();
        std::fs::write(&fails, b"").unwrap();

        let mut config = quiet_free_config();
        config.paths.shell_executable = shell;
        let ledger = FailureLedger::new(dir.path().join("failfile.smoke"));
        let units: Vec<TestUnit> = [&passes, &fails]
            .iter()
            .map(|p| TestUnit::new(p.to_string_lossy(), true))
            .collect();
        ledger.record(&units, &config.server).unwrap();

        // Act
        let summary = Session::new(config).retry_failures(&ledger).await.unwrap();

        // Assert
        assert_eq!(summary.passed, vec![units[0].clone()]);
        assert_eq!(summary.failed, vec![units[1].clone()]);
        let left = ledger.load();
        assert_eq!(left.len(), 1);
        assert!(Path::new(&left[0].test.path).ends_with("fails.js"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retry_restores_auth_defaults_per_entry() {
        use std::os::unix::fs::PermissionsExt;

        // Arrange: a shell that logs its arguments, and the repo's test key
        let dir = tempfile::tempdir().unwrap();
        let args_log = dir.path().join("args.log");
        let shell = dir.path().join("fake-shell");
        std::fs::write(
            &shell,
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do printf '%s\\n' \"$a\" >> '{}'; done\nexit 0\n",
                args_log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&shell, std::fs::Permissions::from_mode(0o755)).unwrap();
        let key_file = default_key_file(dir.path());
        std::fs::create_dir_all(key_file.parent().unwrap()).unwrap();
        std::fs::write(&key_file, "abc def\n").unwrap();
        let script = dir.path().join("replayed.js");
        std::fs::write(&script, b"").unwrap();

        // The session itself runs without auth
        let mut config = quiet_free_config();
        config.paths.shell_executable = shell;
        config.paths.repo_root = dir.path().to_path_buf();
        let config = finalize_config(config, &[]);
        assert!(config.run.key_file.is_none());

        let mut recorded = config.server.clone();
        recorded.auth = AuthMode::Legacy;
        let ledger = FailureLedger::new(dir.path().join("failfile.smoke"));
        let unit = TestUnit::new(script.to_string_lossy(), true);
        ledger.record(std::slice::from_ref(&unit), &recorded).unwrap();

        // Act
        let summary = Session::new(config).retry_failures(&ledger).await.unwrap();

        // Assert
        assert_eq!(summary.passed, vec![unit]);
        let args = std::fs::read_to_string(&args_log).unwrap();
        let expected_key = format!("TestData.keyFile = \"{}\";", key_file.display());
        assert!(args.contains(&expected_key), "{args}");
        assert!(args.contains("TestData.keyFileData = \"abcdef\";"), "{args}");
    }
}
