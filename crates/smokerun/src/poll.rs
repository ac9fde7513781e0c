//! Fixed-interval polling with a bounded attempt count.
//!
//! The harness has no real deadlines: server readiness, replication sync and
//! replica-set election are all waited on by probing a condition once per
//! interval until it holds or the attempt budget runs out.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for polling behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum number of probes.
    pub max_attempts: u32,
    /// Delay before each probe.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::for_server_startup()
    }
}

impl PollConfig {
    /// Budget for a server to open its port: 300 one-second probes.
    pub fn for_server_startup() -> Self {
        Self {
            max_attempts: 300,
            interval: Duration::from_secs(1),
        }
    }

    /// Creates a config with a single immediate probe.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
        }
    }

    /// Worst-case time spent polling.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Probes `check` until it reports `true`.
///
/// A probe that returns an error counts as a failed attempt: the error is
/// logged and polling continues. Only exhausting the budget is fatal.
///
/// # Errors
///
/// Returns [`Error::PollTimeout`] when no probe succeeded.
#[allow(clippy::cognitive_complexity)] // Reason: attempt bookkeeping and logging live in one loop
pub async fn poll_until<F, Fut>(config: &PollConfig, operation_name: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=config.max_attempts {
        sleep(config.interval).await;

        match check().await {
            Ok(true) => {
                if attempt > 1 {
                    debug!("{}: ready after {} attempts", operation_name, attempt);
                }
                return Ok(());
            }
            Ok(false) => {
                debug!(
                    "{}: not ready (attempt {}/{})",
                    operation_name, attempt, config.max_attempts
                );
            }
            Err(e) => {
                warn!(
                    "{}: probe failed (attempt {}/{}): {}",
                    operation_name, attempt, config.max_attempts, e
                );
            }
        }
    }

    Err(Error::PollTimeout {
        operation: operation_name.to_string(),
        attempts: config.max_attempts,
    })
}
