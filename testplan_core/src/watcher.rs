//! Connection watcher for profile exchange.
//!
//! Accumulates distinct profile ids from one event stream until it has
//! seen its target or its own timeout elapses. Duplicates are ignored.

use crate::error::PlanError;
use crate::plan::deadline_in;
use std::collections::BTreeSet;
use std::time::Duration;
use testplan_env::ProfileId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why the watcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Target reached
    Complete,
    /// Timeout elapsed first
    TimedOut,
    /// Cancelled by the owner
    Cancelled,
    /// Event stream ended first
    Closed,
}

/// What the watcher saw before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    pub target: usize,
    pub seen: BTreeSet<ProfileId>,
}

impl WatchReport {
    /// Ok with the seen set when the target was reached.
    pub fn into_result(self) -> Result<BTreeSet<ProfileId>, PlanError> {
        match self.outcome {
            WatchOutcome::Complete => Ok(self.seen),
            WatchOutcome::TimedOut | WatchOutcome::Closed => Err(PlanError::WatcherTimeout {
                seen: self.seen.len(),
                expected: self.target,
            }),
            WatchOutcome::Cancelled => Err(PlanError::Task("connection watcher cancelled".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionWatcher {
    target: usize,
    until: Instant,
}

impl ConnectionWatcher {
    /// Creates a watcher releasing after `target` distinct profiles or `timeout`.
    pub fn new(target: usize, timeout: Duration) -> Self {
        Self {
            target,
            until: deadline_in(timeout),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Consumes profile ids until done.
    pub async fn run(
        self,
        mut profiles: mpsc::UnboundedReceiver<ProfileId>,
        cancel: CancellationToken,
    ) -> WatchReport {
        let mut seen = BTreeSet::new();
        let outcome = loop {
            if seen.len() >= self.target {
                break WatchOutcome::Complete;
            }
            tokio::select! {
                _ = cancel.cancelled() => break WatchOutcome::Cancelled,
                _ = tokio::time::sleep_until(self.until) => break WatchOutcome::TimedOut,
                next = profiles.recv() => match next {
                    Some(profile) => {
                        if seen.insert(profile) {
                            debug!("watcher saw profile {} ({}/{})", profile, seen.len(), self.target);
                        }
                    }
                    None => break WatchOutcome::Closed,
                },
            }
        };

        info!(
            "connection watcher released: {:?}, {} of {} profiles",
            outcome,
            seen.len(),
            self.target
        );
        WatchReport {
            outcome,
            target: self.target,
            seen,
        }
    }

    /// Runs the watcher as a background task.
    pub fn spawn(
        self,
        profiles: mpsc::UnboundedReceiver<ProfileId>,
        cancel: CancellationToken,
    ) -> JoinHandle<WatchReport> {
        tokio::spawn(self.run(profiles, cancel))
    }
}
