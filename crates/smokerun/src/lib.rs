//! # smokerun
//!
//! `smokerun` is a smoke-test harness that drives an external database server
//! through suites of test files. It starts and stops the server, runs each
//! test in isolation, keeps a durable ledger of failing tests, and verifies
//! that a replicated secondary ended up with the same data as its primary.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`server`] | Server launch, readiness polling, liveness, termination |
//! | [`runner`] | One test: command line, captured output, outcome |
//! | [`sequencer`] | Test loop, crash recovery, scheduled restarts |
//! | [`replication`] | Primary/secondary digest comparison |
//! | [`ledger`] | Failing tests across invocations |
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the core script suite against ./mongod
//! smokerun js
//!
//! # Master/slave pair, keep going after failures
//! smokerun --small-oplog --continue-on-failure js
//!
//! # Replay only what failed last time
//! smokerun --only-old-fails
//! ```
//!
//! ## Configuration Example
//!
//! ```toml
//! [server]
//! port = 27999
//! journal = false
//!
//! [paths]
//! server_executable = "./mongod"
//! shell_executable = "./mongo"
//!
//! [run]
//! continue_on_failure = true
//! restart_every = 20
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod poll;
pub mod replication;
pub mod report;
pub mod runner;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod shell;
pub mod skip;
pub mod suite;

pub use config::{AuthMode, ConfigError, OplogMode, RunMode, ServerOptions, SmokeConfig};
pub use error::{Error, Result};
pub use ledger::{FailfileEntry, FailureLedger, RetrySummary};
pub use replication::{CollectionDigests, ReplicationDigestReport};
pub use runner::{RunOutcome, TestExecutor, TestRunner};
pub use sequencer::{RunLedger, SequencerState, SuiteResult, SuiteSequencer};
pub use server::{ManagedServer, NullServer, Role, ServerControl, ServerHandle};
pub use session::Session;
pub use suite::TestUnit;
