//! smokerun CLI
//!
//! Runs test suites against a freshly started database server and reports
//! which tests failed.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use smokerun::config::LEGACY_AUTH_MECHANISM;
use smokerun::runner::split_command;
use smokerun::session::{finalize_config, Session};
use smokerun::{report, suite, AuthMode, FailureLedger, OplogMode, RunMode, SmokeConfig};

#[derive(Parser, Debug)]
#[command(name = "smokerun")]
#[command(version)]
#[command(about = "Run smoke test suites against a database server", long_about = None)]
struct Cli {
    /// Suites (suite mode), test files or command lines (files mode)
    #[arg(value_name = "ARGS")]
    args: Vec<String>,

    /// Configuration file path
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How ARGS are interpreted
    #[arg(long, value_parser = ["suite", "files"])]
    mode: Option<String>,

    /// Directory test executables are resolved against
    #[arg(long, value_name = "DIR")]
    test_path: Option<PathBuf>,

    /// Server executable to run
    #[arg(long = "mongod", value_name = "PATH")]
    server_executable: Option<PathBuf>,

    /// Port the server binds to
    #[arg(long)]
    port: Option<u16>,

    /// Shell interpreter for script tests
    #[arg(long = "mongo", value_name = "PATH")]
    shell_executable: Option<PathBuf>,

    /// Keep testing after a test fails
    #[arg(long)]
    continue_on_failure: bool,

    /// Read ARGS from FILE, one per line ('-' means stdin)
    #[arg(long, value_name = "FILE")]
    from_file: Option<String>,

    /// Prefix for server data directories
    #[arg(long, value_name = "DIR")]
    smoke_db_prefix: Option<PathBuf>,

    /// Additional server flags
    #[arg(long, value_name = "OPTS", allow_hyphen_values = true)]
    smoke_server_opts: Option<String>,

    /// Master/slave replication with a small oplog
    #[arg(long, conflicts_with = "small_oplog_rs")]
    small_oplog: bool,

    /// Replica-set replication with a small oplog
    #[arg(long)]
    small_oplog_rs: bool,

    /// Disable journaling
    #[arg(long)]
    nojournal: bool,

    /// Do not preallocate journal files
    #[arg(long)]
    nopreallocj: bool,

    /// Run servers with authentication enabled
    #[arg(long)]
    auth: bool,

    /// Authentication mechanism used with --auth
    #[arg(long = "authMechanism", value_name = "NAME")]
    auth_mechanism: Option<String>,

    /// Key file for replica-set and sharding tests with auth
    #[arg(long = "keyFile", value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Skip tests whose path matches the regular expression PATTERN
    #[arg(long, value_name = "PATTERN")]
    ignore: Option<String>,

    /// Only run the tests that failed last time
    #[arg(long)]
    only_old_fails: bool,

    /// Clear the failure ledger
    #[arg(long)]
    reset_old_fails: bool,

    /// Failure ledger file
    #[arg(long, value_name = "FILE")]
    failfile: Option<PathBuf>,

    /// Remove data files left by earlier runs
    #[arg(long)]
    with_cleanbb: bool,

    /// Server log file
    #[arg(long, value_name = "FILE")]
    server_log: Option<PathBuf>,

    /// Test output log file (quiet mode)
    #[arg(long, value_name = "FILE")]
    tests_log: Option<PathBuf>,

    /// TAP summary on stdout, details in the tests log
    #[arg(long)]
    quiet: bool,

    /// Shuffle tests instead of sorting them
    #[arg(long)]
    shuffle: bool,

    /// Skip tests sorting before NAME in their directory
    #[arg(long, value_name = "NAME")]
    skip_until: Option<String>,

    /// Do not start a server before running tests
    #[arg(long)]
    dont_start_mongod: bool,

    /// Run shell and servers with TLS
    #[arg(long)]
    use_ssl: bool,

    /// Builder name for buildlogger
    #[arg(long, value_name = "NAME")]
    buildlogger_builder: Option<String>,

    /// Build number for buildlogger
    #[arg(long, value_name = "NUM")]
    buildlogger_buildnum: Option<String>,

    /// File with buildlogger credentials
    #[arg(long, value_name = "FILE")]
    buildlogger_credentials: Option<String>,

    /// Phase shown by buildlogger
    #[arg(long, value_name = "PHASE")]
    buildlogger_phase: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Command-line flags override every other configuration source.
    fn apply(&self, config: &mut SmokeConfig) -> anyhow::Result<()> {
        if let Some(mode) = &self.mode {
            config.run.mode = if mode == "files" {
                RunMode::Files
            } else {
                RunMode::Suite
            };
        }
        if let Some(path) = &self.test_path {
            config.paths.test_path = Some(path.clone());
        }
        if let Some(path) = &self.server_executable {
            config.paths.server_executable = path.clone();
        }
        if let Some(path) = &self.shell_executable {
            config.paths.shell_executable = path.clone();
        }
        if let Some(path) = &self.failfile {
            config.paths.failfile = path.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(prefix) = &self.smoke_db_prefix {
            config.server.db_prefix = prefix.clone();
        }
        if let Some(opts) = &self.smoke_server_opts {
            config.server.extra_flags = split_command(opts)?;
        }
        if self.small_oplog {
            config.server.oplog = OplogMode::MasterSlave;
        }
        if self.small_oplog_rs {
            config.server.oplog = OplogMode::ReplicaSet;
        }
        if self.nojournal {
            config.server.journal = false;
        }
        if self.nopreallocj {
            config.server.prealloc_journal = false;
        }
        if self.auth {
            let mechanism = self
                .auth_mechanism
                .as_deref()
                .unwrap_or(LEGACY_AUTH_MECHANISM);
            config.server.auth = AuthMode::from_flags(true, mechanism);
        }
        if self.use_ssl {
            config.server.tls = true;
        }
        if let Some(path) = &self.server_log {
            config.server.server_log = Some(path.clone());
        }
        if let Some(path) = &self.key_file {
            config.run.key_file = Some(path.clone());
        }
        if let Some(path) = &self.tests_log {
            config.run.tests_log = Some(path.clone());
        }
        if let Some(pattern) = &self.ignore {
            config.run.ignore = Some(pattern.clone());
        }
        if let Some(name) = &self.skip_until {
            config.run.skip_until = Some(name.clone());
        }
        if self.continue_on_failure {
            config.run.continue_on_failure = true;
        }
        if self.quiet {
            config.run.quiet = true;
        }
        if self.shuffle {
            config.run.shuffle = true;
        }
        if self.dont_start_mongod {
            config.run.start_server = false;
        }
        Ok(())
    }

    /// Exports the buildlogger settings; they are all-or-nothing.
    fn export_buildlogger_env(&self) -> anyhow::Result<()> {
        let required = [
            ("MONGO_BUILDER_NAME", &self.buildlogger_builder),
            ("MONGO_BUILD_NUMBER", &self.buildlogger_buildnum),
            ("BUILDLOGGER_CREDENTIALS", &self.buildlogger_credentials),
        ];
        let given = required.iter().filter(|(_, v)| v.is_some()).count();
        if given == 0 {
            return Ok(());
        }
        if given != required.len() {
            bail!(
                "you must set all of --buildlogger-builder, --buildlogger-buildnum, --buildlogger-credentials"
            );
        }

        std::env::set_var(smokerun::server::process::BUILDLOGGER_ENV, "true");
        for (key, value) in required {
            if let Some(value) = value {
                std::env::set_var(key, value);
            }
        }
        if let Some(phase) = &self.buildlogger_phase {
            std::env::set_var("MONGO_PHASE", phase);
        }
        Ok(())
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    cli.export_buildlogger_env()?;

    let mut config = match &cli.config {
        Some(path) => SmokeConfig::load_from_path(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SmokeConfig::load()?,
    };
    cli.apply(&mut config)?;
    config.validate()?;

    let mut args = cli.args.clone();
    if let Some(source) = &cli.from_file {
        args = suite::read_arguments(source)?;
        config.run.raw_commands = config.run.mode == RunMode::Files;
    }

    let config = finalize_config(config, &args);
    let ledger = FailureLedger::new(&config.paths.failfile);

    if cli.only_old_fails {
        let session = Session::new(config);
        match session.retry_failures(&ledger).await {
            Ok(summary) => {
                print!("{}", report::render_retry(&summary));
                std::process::exit(report::retry_exit_code(&summary));
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(e.exit_code());
            }
        }
    }
    if cli.reset_old_fails {
        ledger.clear()?;
        return Ok(());
    }

    let session = Session::new(config);
    let units = session.resolve_units(&args)?;
    if units.is_empty() {
        warn!("no tests specified");
        return Ok(());
    }
    session.check_executables()?;
    if cli.with_cleanbb {
        session.clean_data()?;
    }

    match session.run_suite(&units).await {
        Ok(result) => {
            let failed = result.ledger.failed_units();
            if let Err(e) = ledger.record(&failed, &session.config().server) {
                error!("could not record failing tests: {}", e);
            }
            print!("{}", report::render(&result));
            if let Some(e) = &result.error {
                error!("{}", e);
            }
            std::process::exit(result.exit_code());
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
