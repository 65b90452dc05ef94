//! Named simulation scenarios.
//!
//! Each scenario is one of the core test cases plus a fault profile the
//! runner injects before the nodes start.

use serde::Serialize;
use testplan_core::ScenarioKind;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Every pusher pushes to every remote
    Push,

    /// Every puller pulls from every remote
    Pull,

    /// Connectors exchange profiles with every peer
    ProfileExchange,

    /// Push with one pusher partitioned from one remote
    PartitionedPush,

    /// Pull with the first remote refusing to serve
    RejectingRemote,

    /// Profile exchange under network control with added latency
    SlowLinks,
}

/// Fault injected before the nodes start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BuiltinFault {
    None,

    /// Partition node `a` from node `b` (indices)
    Partition(usize, usize),

    /// Node at this index rejects transfers
    RejectTransfers(usize),

    /// Network control with this link latency in milliseconds
    Latency(u64),

    /// Messages from node `a` to node `b` are lost at this rate (0.0..=1.0)
    Loss(usize, usize, f64),
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Push,
            ScenarioId::Pull,
            ScenarioId::ProfileExchange,
            ScenarioId::PartitionedPush,
            ScenarioId::RejectingRemote,
            ScenarioId::SlowLinks,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Push => "push",
            ScenarioId::Pull => "pull",
            ScenarioId::ProfileExchange => "profile_exchange",
            ScenarioId::PartitionedPush => "partitioned_push",
            ScenarioId::RejectingRemote => "rejecting_remote",
            ScenarioId::SlowLinks => "slow_links",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Push => "pushers push a generated dataset to every remote",
            ScenarioId::Pull => "pullers pull the remotes' dataset from each remote",
            ScenarioId::ProfileExchange => "connectors dial every peer, listeners count connectors",
            ScenarioId::PartitionedPush => "push with node 1 cut off from node 0, one failure expected",
            ScenarioId::RejectingRemote => "pull with remote 0 refusing, every puller records a failure",
            ScenarioId::SlowLinks => "profile exchange with 50ms links applied during network setup",
        }
    }

    /// Core test case this scenario runs.
    pub fn kind(&self) -> ScenarioKind {
        match self {
            ScenarioId::Push | ScenarioId::PartitionedPush => ScenarioKind::Push,
            ScenarioId::Pull | ScenarioId::RejectingRemote => ScenarioKind::Pull,
            ScenarioId::ProfileExchange | ScenarioId::SlowLinks => ScenarioKind::ProfileExchange,
        }
    }

    pub fn builtin_fault(&self) -> BuiltinFault {
        match self {
            ScenarioId::PartitionedPush => BuiltinFault::Partition(1, 0),
            ScenarioId::RejectingRemote => BuiltinFault::RejectTransfers(0),
            ScenarioId::SlowLinks => BuiltinFault::Latency(50),
            _ => BuiltinFault::None,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "push" => Ok(ScenarioId::Push),
            "pull" => Ok(ScenarioId::Pull),
            "profile_exchange" | "profiles" => Ok(ScenarioId::ProfileExchange),
            "partitioned_push" => Ok(ScenarioId::PartitionedPush),
            "rejecting_remote" => Ok(ScenarioId::RejectingRemote),
            "slow_links" => Ok(ScenarioId::SlowLinks),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("profile-exchange".parse::<ScenarioId>(), Ok(ScenarioId::ProfileExchange));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(ScenarioId::PartitionedPush.kind(), ScenarioKind::Push);
        assert_eq!(ScenarioId::SlowLinks.kind(), ScenarioKind::ProfileExchange);
    }
}
