//! Test Plan Core - coordination layer for distributed network test plans
//!
//! Many independently running nodes execute one scenario together and can
//! only talk through a shared barrier-and-broadcast service. This crate
//! keeps them in lockstep:
//! 1. **Roles**: every node derives its role from its sequence number alone
//! 2. **Phases**: join, network setup, construction, info exchange and
//!    completion, each closed by a barrier at the instance count
//! 3. **Failures**: per-peer errors of a fan-out are aggregated, never lost

pub mod actor;
pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod exchange;
pub mod failure;
pub mod plan;
pub mod role;
pub mod scenarios;
pub mod states;
pub mod watcher;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use actor::{Actor, ActorConstructor, ActorParts};
pub use config::{PlanConfig, RunContext, RunEnv};
pub use error::PlanError;
pub use exchange::{ActorInfoExchange, PeerTable};
pub use failure::{combine, fan_out, AggregatedError, FailureAggregator};
pub use plan::{Phase, Plan};
pub use role::{assign_role, Role, RoleAssigner};
pub use scenarios::{run_scenario, NodeReport, ScenarioKind, ScenarioState};
pub use watcher::{ConnectionWatcher, WatchOutcome, WatchReport};
