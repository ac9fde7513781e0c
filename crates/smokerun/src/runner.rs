//! Single-test execution.
//!
//! [`TestRunner`] turns a [`TestUnit`] into a command line, runs it with its
//! output captured, and classifies the result as a [`RunOutcome`]. When the
//! session started a server, the server port is probed after every test so a
//! crash is attributed to the test that was running.

use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{OplogMode, SmokeConfig};
use crate::error::{Error, Result};
use crate::server::probe;
use crate::server::process::buildlogger_wrap;
use crate::skip::SkipContext;
use crate::suite::TestUnit;

/// Exit status recorded for a test after which the server was gone.
pub const SERVER_DIED_STATUS: i32 = -1;

/// Captured output stays in memory up to this size, then spills to disk.
pub const OUTPUT_SPOOL_LIMIT: usize = 16 * 1024 * 1024;

/// Environment variable naming the running test for the child.
pub const TEST_FILENAME_ENV: &str = "MONGO_TEST_FILENAME";

/// Result of running one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit code 0 and the server still up.
    Success,
    /// Nonzero exit code, server still up.
    ExitFailure {
        /// Exit code reported by the test.
        exit_code: i32,
    },
    /// The server was unreachable after the test finished.
    ServerDied,
}

impl RunOutcome {
    /// Classifies an exit code alone.
    #[must_use]
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Success
        } else {
            Self::ExitFailure { exit_code }
        }
    }

    /// Status recorded in the failure map, if this is a failure.
    #[must_use]
    pub fn failure_status(&self) -> Option<i32> {
        match self {
            Self::Success => None,
            Self::ExitFailure { exit_code } => Some(*exit_code),
            Self::ServerDied => Some(SERVER_DIED_STATUS),
        }
    }
}

/// How a test is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Script run by the shell interpreter.
    Script,
    /// Compiled test program.
    NativeBinary {
        /// Formats its own output, which is streamed instead of captured.
        self_formatting: bool,
    },
    /// Literal command line.
    Raw,
}

/// A fully resolved test command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Launch shape.
    pub kind: InvocationKind,
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Path the test is reported under.
    pub display_path: String,
}

impl Invocation {
    /// Resolves the command for `unit` under `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bug`] for an extension no test kind handles, or an
    /// error if a literal command line cannot be split.
    pub fn for_unit(
        unit: &TestUnit,
        config: &SmokeConfig,
        key_file_data: Option<&str>,
    ) -> Result<Self> {
        if config.run.raw_commands {
            return Self::raw(&unit.path);
        }

        match unit.extension().as_str() {
            ".js" => Ok(Self::script(unit, config, key_file_data)),
            "" | ".exe" => Ok(Self::native(unit, config)),
            other => Err(Error::Bug(format!(
                "no way to run '{}' (extension '{}')",
                unit.path, other
            ))),
        }
    }

    fn raw(line: &str) -> Result<Self> {
        let argv = if cfg!(windows) {
            vec![line.to_string()]
        } else {
            split_command(line)?
        };
        let display_path = raw_display_path(&argv)
            .ok_or_else(|| Error::Config(format!("empty command line '{line}'")))?;
        Ok(Self {
            kind: InvocationKind::Raw,
            argv,
            display_path,
        })
    }

    fn script(unit: &TestUnit, config: &SmokeConfig, key_file_data: Option<&str>) -> Self {
        let options = &config.server;
        let mut argv = vec![
            config.paths.shell_executable.display().to_string(),
            "--port".to_string(),
            options.port.to_string(),
        ];
        if let Some(mechanism) = options.auth.mechanism() {
            argv.push("--authenticationMechanism".to_string());
            argv.push(mechanism.to_string());
        }
        if !unit.requires_server {
            argv.push("--nodb".to_string());
        }
        if options.tls {
            argv.push("--ssl".to_string());
        }
        argv.push(unit.path.clone());
        argv.push("--eval".to_string());
        argv.push(test_data_script(unit, config, key_file_data));

        Self {
            kind: InvocationKind::Script,
            argv,
            display_path: unit.path.clone(),
        }
    }

    fn native(unit: &TestUnit, config: &SmokeConfig) -> Self {
        let program = unit.file_name();
        let stem = program.strip_suffix(".exe").unwrap_or(program);

        let (mut argv, self_formatting) = match stem {
            "test" | "perftest" => (vec![unit.path.clone()], stem == "test"),
            "mongos" => (vec![unit.path.clone(), "--test".to_string()], false),
            _ => {
                let path = match &config.paths.test_path {
                    Some(dir) => absolute_lossy(&dir.join(&unit.path)),
                    None => unit.path.clone(),
                };
                (
                    vec![path, "--port".to_string(), config.server.port.to_string()],
                    false,
                )
            }
        };

        if stem.ends_with("test") && !config.server.prealloc_journal {
            argv.push("--nopreallocj".to_string());
        }

        Self {
            kind: InvocationKind::NativeBinary { self_formatting },
            argv,
            display_path: unit.path.clone(),
        }
    }

    /// Whether output is streamed rather than captured.
    #[must_use]
    pub fn is_self_formatting(&self) -> bool {
        matches!(
            self.kind,
            InvocationKind::NativeBinary {
                self_formatting: true
            }
        )
    }

    /// Basename the test is reported under.
    #[must_use]
    pub fn display_name(&self) -> &str {
        Path::new(&self.display_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.display_path)
    }
}

fn absolute_lossy(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Program name, or the script when the program is a Python interpreter.
fn raw_display_path(argv: &[String]) -> Option<String> {
    let program = argv.first()?;
    let base = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    if matches!(base, "python" | "python.exe") {
        if let Some(script) = argv.get(1) {
            return Some(script.clone());
        }
    }
    Some(program.clone())
}

/// Splits a command line the way a POSIX shell would, without expansion.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unterminated quote or trailing escape.
pub fn split_command(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => word.push(ch),
                            Some(ch) => {
                                word.push('\\');
                                word.push(ch);
                            }
                            None => return Err(unterminated(line)),
                        },
                        Some(ch) => word.push(ch),
                        None => return Err(unterminated(line)),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => word.push(ch),
                    None => return Err(unterminated(line)),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn unterminated(line: &str) -> Error {
    Error::Config(format!("unterminated quote or escape in command '{line}'"))
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

fn js_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// The `--eval` preamble handed to every script test.
#[must_use]
pub fn test_data_script(unit: &TestUnit, config: &SmokeConfig, key_file_data: Option<&str>) -> String {
    let options = &config.server;
    let key_file = config.run.key_file.as_ref();

    let mut script = String::from("TestData = new Object();");
    script.push_str(&format!("TestData.testPath = {};", js_string(&unit.path)));
    script.push_str(&format!("TestData.testFile = {};", js_string(unit.file_name())));
    script.push_str(&format!("TestData.testName = {};", js_string(unit.test_name())));
    script.push_str(&format!("TestData.noJournal = {};", js_bool(!options.journal)));
    script.push_str(&format!(
        "TestData.noJournalPrealloc = {};",
        js_bool(!options.prealloc_journal)
    ));
    script.push_str(&format!("TestData.auth = {};", js_bool(options.auth.is_enabled())));
    script.push_str(&format!(
        "TestData.keyFile = {};",
        key_file.map_or_else(|| "null".to_string(), |k| js_string(&k.display().to_string()))
    ));
    script.push_str(&format!(
        "TestData.keyFileData = {};",
        match (key_file, key_file_data) {
            (Some(_), Some(data)) => js_string(data),
            _ => "null".to_string(),
        }
    ));
    script.push_str(&format!("TestData.useSSL = {};", js_bool(options.tls)));
    if options.oplog != OplogMode::Default {
        script.push_str("testingReplication = true;");
    }
    if options.auth.is_enabled() && unit.requires_server {
        script.push_str("jsTest.authenticate(db.getMongo());");
    }
    script
}

/// Reads a key file with all whitespace removed and restricts it to the owner.
///
/// # Errors
///
/// Returns an IO error if the file cannot be read or its mode changed.
pub fn load_key_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(raw.chars().filter(|c| !c.is_whitespace()).collect())
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    1
}

/// Runs tests one at a time; the seam between the sequencer and processes.
#[async_trait]
pub trait TestExecutor: Send {
    /// Why `unit` must not run in this session, if it must not.
    fn skip_reason(&self, unit: &TestUnit) -> Option<&'static str>;

    /// Records whether the primary is a debug build.
    fn note_debug_build(&mut self, debug_build: bool);

    /// Runs `unit` as test number `seq` (starting at 1).
    async fn run(&mut self, unit: &TestUnit, seq: usize) -> Result<RunOutcome>;
}

/// [`TestExecutor`] that launches real child processes.
#[derive(Debug)]
pub struct TestRunner {
    config: SmokeConfig,
    key_file_data: Option<String>,
    skip: SkipContext,
    tests_log: Option<File>,
}

impl TestRunner {
    /// Creates a runner, reading the key file and opening the tests log.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the key file or tests log cannot be opened.
    pub fn new(config: SmokeConfig) -> Result<Self> {
        let key_file_data = config
            .run
            .key_file
            .as_deref()
            .map(load_key_file)
            .transpose()?;

        let tests_log = match (&config.run.tests_log, config.run.quiet) {
            (Some(path), true) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Some(File::create(path)?)
            }
            _ => None,
        };

        let skip = SkipContext {
            small_oplog: config.server.oplog == OplogMode::MasterSlave,
            auth: config.server.auth.is_enabled() || config.run.key_file.is_some(),
            debug_build: false,
        };

        Ok(Self {
            config,
            key_file_data,
            skip,
            tests_log,
        })
    }

    /// Where verbose output goes: the tests log in quiet mode, else stdout.
    fn verbose_sink(&mut self, quiet_log: bool) -> Box<dyn Write + Send + '_> {
        match (&mut self.tests_log, quiet_log) {
            (Some(file), true) => Box::new(file),
            _ => Box::new(io::stdout()),
        }
    }

    fn command_for(&self, invocation: &Invocation, capture: bool) -> Result<Command> {
        let argv = buildlogger_wrap(invocation.argv.clone(), false);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Bug("empty test command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(TEST_FILENAME_ENV, invocation.display_name())
            .stdin(Stdio::null())
            .stdout(if capture { Stdio::piped() } else { Stdio::inherit() })
            .kill_on_drop(true);
        if let Some(dir) = &self.config.paths.test_path {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    /// Runs the child, draining its stdout into `captured` while it runs.
    async fn execute(
        &self,
        invocation: &Invocation,
        captured: Option<&mut tempfile::SpooledTempFile>,
    ) -> Result<i32> {
        let mut cmd = self.command_for(invocation, captured.is_some())?;
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: invocation.argv.first().cloned().unwrap_or_default(),
            source,
        })?;

        if let (Some(buffer), Some(mut stdout)) = (captured, child.stdout.take()) {
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                let n = stdout.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buffer.write_all(&chunk[..n])?;
            }
        }

        let status = child.wait().await?;
        Ok(exit_code_of(status))
    }
}

fn copy_captured(captured: &mut tempfile::SpooledTempFile, out: &mut dyn Write) -> io::Result<()> {
    captured.seek(SeekFrom::Start(0))?;
    io::copy(captured, out)?;
    out.flush()
}

#[async_trait]
impl TestExecutor for TestRunner {
    fn skip_reason(&self, unit: &TestUnit) -> Option<&'static str> {
        self.skip.reason(unit)
    }

    fn note_debug_build(&mut self, debug_build: bool) {
        self.skip.debug_build = debug_build;
    }

    async fn run(&mut self, unit: &TestUnit, seq: usize) -> Result<RunOutcome> {
        let invocation = Invocation::for_unit(unit, &self.config, self.key_file_data.as_deref())?;
        let quiet = self.config.run.quiet;
        let quiet_log = quiet && !invocation.is_self_formatting();
        let name = invocation.display_name().to_string();

        {
            let mut vlog = self.verbose_sink(quiet_log);
            writeln!(vlog, " *******************************************")?;
            writeln!(vlog, "         Test : {name} ...")?;
            writeln!(vlog, "      Command : {}", invocation.argv.join(" "))?;
            writeln!(
                vlog,
                "         Date : {}",
                chrono::Local::now().format("%a %b %e %H:%M:%S %Y")
            )?;
            vlog.flush()?;
        }

        let mut captured =
            (!invocation.is_self_formatting()).then(|| tempfile::spooled_tempfile(OUTPUT_SPOOL_LIMIT));

        let started = Instant::now();
        let exit_code = self.execute(&invocation, captured.as_mut()).await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!("{} exited with {} after {:.3}ms", name, exit_code, elapsed_ms);

        {
            let mut vlog = self.verbose_sink(quiet_log);
            writeln!(vlog, "                {elapsed_ms:.3}ms")?;
            if let Some(buffer) = captured.as_mut() {
                copy_captured(buffer, &mut vlog)?;
            }
            vlog.flush()?;
        }

        if quiet {
            let mut stdout = io::stdout();
            if exit_code == 0 {
                writeln!(stdout, "ok {seq} {name}")?;
            } else {
                writeln!(stdout, "not ok {seq} {name} # exit {exit_code}")?;
            }
            stdout.flush()?;
            if exit_code != 0 {
                if let Some(buffer) = captured.as_mut() {
                    copy_captured(buffer, &mut io::stderr())?;
                }
            }
        }
        drop(captured);

        if self.config.run.start_server {
            if let Err(e) = probe::check_port(self.config.server.port).await {
                warn!("server not running after executing test {}: {}", invocation.display_path, e);
                return Ok(RunOutcome::ServerDied);
            }
        }

        let outcome = RunOutcome::from_exit_code(exit_code);
        if let RunOutcome::ExitFailure { exit_code } = outcome {
            info!("test {} exited with status {}", invocation.display_path, exit_code);
        }
        Ok(outcome)
    }
}

/// Key file used by auth sessions when none is configured.
#[must_use]
pub fn default_key_file(repo_root: &Path) -> PathBuf {
    repo_root.join("jstests").join("libs").join("authTestsKey")
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod runner_tests;
