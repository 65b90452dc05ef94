//! Canonical state and topic names.
//!
//! The sync service keeps one counter per state name for the whole run,
//! so each name here carries exactly one meaning and is never reused by
//! another phase or scenario.

use testplan_env::{ActorInfo, NetworkConfig, StateName, Topic};

/// Sequence assignment at join time
pub const ASSIGN_SEQ: StateName = StateName::from_static("assign-seq");

/// Network control reports the node's interface ready
pub const NETWORK_INITIALIZED: StateName = StateName::from_static("network-initialized");

/// Link shape applied
pub const NETWORK_CONFIGURED: StateName = StateName::from_static("network-configured");

pub const ACTOR_CONSTRUCTED: StateName = StateName::from_static("actor constructed");
pub const ACTOR_INFO_PUBLISHED: StateName = StateName::from_static("actor info published");

pub const PUSH_ATTEMPTED: StateName = StateName::from_static("push to all remotes attempted");
pub const PULL_ATTEMPTED: StateName = StateName::from_static("pull from all remotes attempted");
pub const PROFILES_RECEIVED: StateName = StateName::from_static("done receiving profiles");

pub const FINISHED: StateName = StateName::from_static("finished");

/// Every node publishes its [`ActorInfo`] here exactly once.
pub const ACTOR_INFO_TOPIC: Topic<ActorInfo> = Topic::new("actor-info");

/// Link-shaping requests for the node on `hostname`.
pub fn network_topic(hostname: &str) -> Topic<NetworkConfig> {
    Topic::named(format!("network:{hostname}"))
}
