//! Suite sequencing.
//!
//! [`SuiteSequencer`] brings up the session's servers, runs every test in
//! order through a [`TestExecutor`], keeps the [`RunLedger`] and recovers from
//! crashes. Servers it started are always stopped again, newest first, no
//! matter how the run ends.

use std::collections::BTreeMap;
use std::io::Write;
use tracing::{error, info, warn};

use crate::config::{OplogMode, SmokeConfig};
use crate::error::{Error, Result};
use crate::replication::{self, ReplicationDigestReport};
use crate::runner::{RunOutcome, TestExecutor, SERVER_DIED_STATUS};
use crate::server::ServerControl;
use crate::suite::TestUnit;

/// Lifecycle of one sequencer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencerState {
    /// `run` has not been called.
    #[default]
    NotStarted,
    /// Tests are executing.
    Running,
    /// Every test was attempted.
    Completed,
    /// Stopped at the first failing test.
    AbortedByFailure,
    /// Stopped because the server died.
    AbortedByServerDeath,
    /// Stopped by an error of the harness itself.
    AbortedByHarnessError,
}

/// Bookkeeping of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLedger {
    /// Passing tests, in run order.
    pub succeeded: Vec<TestUnit>,
    /// Failing tests and their exit status ([`SERVER_DIED_STATUS`] after a crash).
    pub failed: BTreeMap<TestUnit, i32>,
    /// Tests the skip rules excluded.
    pub skipped: Vec<TestUnit>,
    /// The test currently executing; at most one entry.
    pub in_flight: Vec<TestUnit>,
}

impl RunLedger {
    /// Tests to record as failing, in path order: every failure plus a test
    /// that was still running when the harness gave up.
    #[must_use]
    pub fn failed_units(&self) -> Vec<TestUnit> {
        let mut units: Vec<TestUnit> = self
            .failed
            .keys()
            .chain(self.in_flight.iter())
            .cloned()
            .collect();
        units.sort();
        units.dedup();
        units
    }

    /// Tests that reached an outcome (including skips).
    #[must_use]
    pub fn accounted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

/// What a finished run hands back.
#[derive(Debug)]
pub struct SuiteResult {
    /// Per-test bookkeeping.
    pub ledger: RunLedger,
    /// Final state.
    pub state: SequencerState,
    /// Replication comparison, when a secondary ran and the run completed.
    pub replication: Option<ReplicationDigestReport>,
    /// Harness error that ended the run early, if any.
    pub error: Option<Error>,
    /// Number of tests the run was given.
    pub total: usize,
}

impl SuiteResult {
    /// Tests that never reached an outcome.
    #[must_use]
    pub fn not_run(&self) -> usize {
        self.total.saturating_sub(self.ledger.accounted())
    }

    /// Whether the replicated data diverged.
    #[must_use]
    pub fn replication_diverged(&self) -> bool {
        self.replication
            .as_ref()
            .is_some_and(|r| !r.is_consistent())
    }

    /// Process exit code: the harness error's own code, 2 after a server
    /// death, 1 on any failure, else 0.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if let Some(error) = &self.error {
            error.exit_code()
        } else if self.state == SequencerState::AbortedByServerDeath {
            2
        } else if self.state == SequencerState::AbortedByFailure
            || !self.ledger.failed.is_empty()
            || self.replication_diverged()
        {
            1
        } else {
            0
        }
    }
}

/// Runs a list of tests against the session's servers.
pub struct SuiteSequencer {
    config: SmokeConfig,
    primary: Box<dyn ServerControl>,
    secondary: Option<Box<dyn ServerControl>>,
    executor: Box<dyn TestExecutor>,
    state: SequencerState,
    ledger: RunLedger,
    primary_running: bool,
    secondary_running: bool,
}

impl SuiteSequencer {
    /// Creates a sequencer. A secondary is only started in replication modes.
    pub fn new(
        config: SmokeConfig,
        primary: Box<dyn ServerControl>,
        secondary: Option<Box<dyn ServerControl>>,
        executor: Box<dyn TestExecutor>,
    ) -> Self {
        Self {
            config,
            primary,
            secondary,
            executor,
            state: SequencerState::NotStarted,
            ledger: RunLedger::default(),
            primary_running: false,
            secondary_running: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SequencerState {
        self.state
    }

    /// Runs `units` in order.
    ///
    /// Test failures are reported in the returned [`SuiteResult`]. When the
    /// harness itself cannot continue (a server never came up, a scheduled
    /// restart failed, a replication command failed) the error is stored in
    /// [`SuiteResult::error`] next to everything recorded up to that point.
    /// Servers are stopped before returning in every case.
    pub async fn run(mut self, units: &[TestUnit]) -> SuiteResult {
        self.state = SequencerState::Running;
        let outcome = self.drive(units).await;
        self.shutdown().await;

        let (replication, error) = match outcome {
            Ok(replication) => (replication, None),
            Err(e) => {
                error!("run aborted: {}", e);
                self.state = SequencerState::AbortedByHarnessError;
                (None, Some(e))
            }
        };
        SuiteResult {
            ledger: self.ledger,
            state: self.state,
            replication,
            error,
            total: units.len(),
        }
    }

    async fn drive(&mut self, units: &[TestUnit]) -> Result<Option<ReplicationDigestReport>> {
        self.start_servers().await?;
        let replicated = self.secondary.is_some();

        if replicated {
            self.primary.replication_fence().await?;
        }

        if self.config.run.quiet {
            let mut stdout = std::io::stdout();
            writeln!(stdout, "1..{}", units.len())?;
            stdout.flush()?;
        }

        for (index, unit) in units.iter().enumerate() {
            let seq = index + 1;

            if let Some(reason) = self.executor.skip_reason(unit) {
                info!("skipping {} ({})", unit.path, reason);
                self.ledger.skipped.push(unit.clone());
                continue;
            }

            // Stays in flight if the executor errors out.
            self.ledger.in_flight.push(unit.clone());
            let outcome = self.executor.run(unit, seq).await?;
            self.ledger.in_flight.pop();

            match outcome {
                RunOutcome::Success => {
                    self.ledger.succeeded.push(unit.clone());
                    if replicated {
                        self.primary.replication_fence().await?;
                    } else if unit.requires_server
                        && seq.checked_rem(self.config.run.restart_every) == Some(0)
                    {
                        self.restart_primary().await?;
                    }
                }
                RunOutcome::ExitFailure { exit_code } => {
                    warn!("test {} exited with status {}", unit.path, exit_code);
                    self.ledger.failed.insert(unit.clone(), exit_code);
                    if !self.config.run.continue_on_failure {
                        self.state = SequencerState::AbortedByFailure;
                        return Ok(None);
                    }
                    if replicated {
                        self.primary.replication_fence().await?;
                    }
                }
                RunOutcome::ServerDied => {
                    error!("server not running after executing test {}", unit.path);
                    self.ledger.failed.insert(unit.clone(), SERVER_DIED_STATUS);
                    self.relaunch_primary().await;
                    self.state = SequencerState::AbortedByServerDeath;
                    return Ok(None);
                }
            }
        }

        self.state = SequencerState::Completed;

        match &self.secondary {
            Some(secondary) => {
                self.primary.replication_fence().await?;
                let report = replication::check(self.primary.as_ref(), secondary.as_ref()).await?;
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    async fn start_servers(&mut self) -> Result<()> {
        self.primary.start().await?;
        self.primary_running = true;
        self.executor.note_debug_build(self.primary.is_debug_build());

        if let Some(secondary) = self.secondary.as_mut() {
            secondary.start().await?;
            self.secondary_running = true;

            if self.config.server.oplog == OplogMode::ReplicaSet {
                let port = secondary
                    .port()
                    .ok_or_else(|| Error::Bug("secondary started without a port".to_string()))?;
                self.primary.initiate_replica_set(port).await?;
            }
        }
        Ok(())
    }

    /// Scheduled restart; any failure ends the run.
    async fn restart_primary(&mut self) -> Result<()> {
        info!("restarting {} server", self.primary.role());
        self.primary_running = false;
        self.primary.stop().await?;
        self.primary.start().await?;
        self.primary_running = true;
        Ok(())
    }

    /// One relaunch attempt after a crash. Failures are only logged: the run
    /// is aborting anyway.
    async fn relaunch_primary(&mut self) {
        info!("restarting {} server after crash", self.primary.role());
        if self.primary_running {
            if let Err(e) = self.primary.stop().await {
                warn!("failed to reap dead server: {}", e);
            }
            self.primary_running = false;
        }
        match self.primary.start().await {
            Ok(()) => self.primary_running = true,
            Err(e) => error!("relaunch failed: {}", e),
        }
    }

    /// Stops started servers, newest first. Errors are logged, never returned.
    async fn shutdown(&mut self) {
        if self.secondary_running {
            if let Some(secondary) = self.secondary.as_mut() {
                if let Err(e) = secondary.stop().await {
                    warn!("failed to stop {} server: {}", secondary.role(), e);
                }
            }
            self.secondary_running = false;
        }
        if self.primary_running {
            if let Err(e) = self.primary.stop().await {
                warn!("failed to stop {} server: {}", self.primary.role(), e);
            }
            self.primary_running = false;
        }
    }
}

#[cfg(test)]
#[path = "sequencer_tests.rs"]
mod sequencer_tests;
