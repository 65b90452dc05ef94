//! Deterministic role assignment.
//!
//! Every node derives its role from its own sequence number and the shared
//! instance count, with no communication. With ratio `r`, nodes are split
//! into groups of `r + 1`: the first node of each group is the responder
//! (remote, connector) and the remaining `r` are initiators (pushers,
//! pullers, listeners).

use crate::error::PlanError;
use serde::{Deserialize, Serialize};

/// Role of a node within a ratio-partitioned scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Serves the scenario action (remote, connector)
    Responder,
    /// Drives the scenario action (pusher, puller, listener)
    Initiator,
}

/// Pure role function: responder iff `seq mod (ratio + 1) == 0`.
pub fn assign_role(seq: u64, ratio: u64) -> Role {
    if seq % (ratio + 1) == 0 {
        Role::Responder
    } else {
        Role::Initiator
    }
}

/// Validated role assignment for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleAssigner {
    ratio: u64,
    instances: u64,
}

impl RoleAssigner {
    /// Validates `ratio` against the run's instance count.
    ///
    /// A ratio of zero, or one that would leave no initiator
    /// (`ratio >= instances`), is rejected.
    pub fn new(ratio: u64, instances: u64) -> Result<Self, PlanError> {
        if ratio == 0 || ratio >= instances {
            return Err(PlanError::InvalidRatio { ratio, instances });
        }
        Ok(Self { ratio, instances })
    }

    pub fn ratio(&self) -> u64 {
        self.ratio
    }

    pub fn instances(&self) -> u64 {
        self.instances
    }

    pub fn role(&self, seq: u64) -> Role {
        assign_role(seq, self.ratio)
    }

    /// `ceil(N / (ratio + 1))`
    pub fn responder_count(&self) -> u64 {
        self.instances.div_ceil(self.ratio + 1)
    }

    pub fn initiator_count(&self) -> u64 {
        self.instances - self.responder_count()
    }
}
