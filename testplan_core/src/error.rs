//! Errors raised by the coordination layer.

use crate::failure::AggregatedError;
use crate::plan::Phase;
use std::time::Duration;
use testplan_env::{EnvError, StateName};
use thiserror::Error;

/// Coordination errors.
///
/// Everything except [`PlanError::Partial`] is fatal for the node that
/// raises it. Timeouts are kept apart from connectivity failures so a stuck
/// phase can be told from a dead peer.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The sync service (or another collaborator) failed
    #[error(transparent)]
    Env(#[from] EnvError),

    /// Role ratio cannot produce at least one responder and one initiator
    #[error("ratio {ratio} requires more than {instances} instances (and at least 1)")]
    InvalidRatio { ratio: u64, instances: u64 },

    /// Barrier target outside `1..=instances`
    #[error("barrier {state} target {target} is outside 1..={instances}")]
    BarrierTarget {
        state: StateName,
        target: u64,
        instances: u64,
    },

    /// A wait exceeded the run deadline or a phase sub-timeout
    #[error("timed out during {phase} after {after:?}")]
    Timeout { phase: String, after: Duration },

    /// Info exchange ended without a full peer table
    #[error("info exchange ended with {received} of {expected} peers")]
    IncompleteExchange { received: usize, expected: usize },

    /// Scenario code called a coordinator phase out of order
    #[error("cannot enter {attempted} while in {current}")]
    PhaseOrder { attempted: Phase, current: Phase },

    /// The caller-supplied constructor failed
    #[error("actor construction failed: {0}")]
    Construction(String),

    /// The actor was used before it was constructed
    #[error("no actor has been constructed")]
    NoActor,

    /// A run parameter could not be parsed
    #[error("invalid parameter {name}={value:?}")]
    InvalidParam { name: String, value: String },

    /// The requested test case does not exist
    #[error("unknown test case {0:?}")]
    UnknownScenario(String),

    /// The connection watcher released before seeing every expected peer
    #[error("connection watcher saw {seen} of {expected} peers before its timeout")]
    WatcherTimeout { seen: usize, expected: usize },

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),

    /// Filesystem failure in the actor's repository directory
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Non-fatal failures recorded during the run
    #[error("{0}")]
    Partial(AggregatedError),

    /// A fatal error plus everything recorded before it
    #[error("{cause}\n{partial}")]
    Aborted {
        cause: Box<PlanError>,
        partial: AggregatedError,
    },
}

impl PlanError {
    /// Creates a timeout error for `phase`.
    pub fn timeout(phase: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            phase: phase.into(),
            after,
        }
    }

    /// Returns true for any flavour of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PlanError::Timeout { .. } | PlanError::WatcherTimeout { .. })
    }
}
