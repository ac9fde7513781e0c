//! Durable record of failing tests across invocations.
//!
//! The ledger file is a JSON array of [`FailfileEntry`]. Every failing test is
//! stored with the server options it failed under, so `--only-old-fails` can
//! replay it under the same configuration. The file is always rewritten as a
//! whole through a temporary file in the same directory.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::ServerOptions;
use crate::error::{Error, Result};
use crate::suite::TestUnit;

/// A failing test and the options it failed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailfileEntry {
    /// The failing test.
    pub test: TestUnit,
    /// Server options at the time of failure.
    pub options: ServerOptions,
}

/// What a replay of the ledger did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Entries removed: replayed and passed, or whose test no longer exists.
    pub passed: Vec<TestUnit>,
    /// Entries replayed that failed again.
    pub failed: Vec<TestUnit>,
    /// Entries kept without replaying.
    pub kept: Vec<TestUnit>,
}

impl RetrySummary {
    /// Total number of entries the ledger held.
    #[must_use]
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.kept.len()
    }
}

/// Only script tests and the unit-test binary are safe to replay alone.
fn is_replayable(unit: &TestUnit) -> bool {
    matches!(unit.file_name(), "test" | "test.exe") || unit.path.ends_with(".js")
}

/// The failure ledger file.
#[derive(Debug, Clone)]
pub struct FailureLedger {
    path: PathBuf,
}

impl FailureLedger {
    /// Creates a ledger backed by `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the ledger strictly.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LedgerCorrupt`] if the file exists but cannot be
    /// decoded, or an IO error if it cannot be read.
    pub fn try_load(&self) -> Result<Vec<FailfileEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data).map_err(|e| Error::LedgerCorrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Reads the ledger; an unreadable ledger counts as "no prior failures"
    /// and is deleted.
    #[must_use]
    pub fn load(&self) -> Vec<FailfileEntry> {
        match self.try_load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("discarding failure ledger: {}", e);
                if let Err(rm) = self.clear() {
                    warn!("could not delete failure ledger {:?}: {}", self.path, rm);
                }
                Vec::new()
            }
        }
    }

    /// Adds every `(unit, options)` pair not already recorded.
    ///
    /// Returns the number of entries added. The file is only written when
    /// something was added.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    pub fn record(&self, units: &[TestUnit], options: &ServerOptions) -> Result<usize> {
        let mut entries = self.load();
        let before = entries.len();

        for unit in units {
            let entry = FailfileEntry {
                test: unit.clone(),
                options: options.clone(),
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }

        let added = entries.len() - before;
        if added > 0 {
            self.persist(&entries)?;
            debug!("recorded {} failing tests in {:?}", added, self.path);
        }
        Ok(added)
    }

    /// Replays every entry through `replay`, which returns whether the test
    /// passed. Passing entries are removed and the rest written back; an empty
    /// ledger is deleted.
    ///
    /// # Errors
    ///
    /// Returns the first error from `replay` or from rewriting the ledger.
    /// The ledger is rewritten before a replay error is returned.
    pub async fn retry_only<F, Fut>(&self, mut replay: F) -> Result<RetrySummary>
    where
        F: FnMut(FailfileEntry) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let entries = self.load();
        let mut summary = RetrySummary::default();
        let mut remaining = Vec::new();
        let mut replay_error = None;

        let mut pending = entries.into_iter();
        for entry in pending.by_ref() {
            if !Path::new(&entry.test.path).exists() {
                info!("{} no longer exists, dropping it", entry.test.path);
                summary.passed.push(entry.test);
                continue;
            }

            if !is_replayable(&entry.test) {
                summary.kept.push(entry.test.clone());
                remaining.push(entry);
                continue;
            }

            match replay(entry.clone()).await {
                Ok(true) => summary.passed.push(entry.test),
                Ok(false) => {
                    summary.failed.push(entry.test.clone());
                    remaining.push(entry);
                }
                Err(e) => {
                    remaining.push(entry);
                    replay_error = Some(e);
                    break;
                }
            }
        }
        remaining.extend(pending);

        if remaining.is_empty() {
            self.clear()?;
        } else {
            self.persist(&remaining)?;
        }

        match replay_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Deletes the ledger file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if an existing file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, entries: &[FailfileEntry]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, entries)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
