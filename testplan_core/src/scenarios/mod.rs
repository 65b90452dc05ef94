//! Scenario state machines.
//!
//! A scenario drives one node through
//! `idle -> network-ready -> role-assigned -> constructed -> info-shared ->
//! acting -> done`, logging every transition. Setup errors (anything before
//! `acting`) are fatal; failures while acting are recorded and the node
//! still finishes.

mod profile_exchange;
mod remote_transfer;

pub use profile_exchange::{ProfileExchangeConstructor, PROFILE_PROTOCOL};
pub use remote_transfer::{TransferActorConstructor, TransferMode, TransferRemoteHooks};

use crate::actor::ActorParts;
use crate::config::{PlanConfig, RunEnv};
use crate::error::PlanError;
use crate::plan::Plan;
use crate::role::{Role, RoleAssigner};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use testplan_env::{NetworkShaper, SyncService};
use tracing::{error, info};

/// Test cases this crate can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    Push,
    Pull,
    ProfileExchange,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 3] = [ScenarioKind::Push, ScenarioKind::Pull, ScenarioKind::ProfileExchange];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::Push => "push",
            ScenarioKind::Pull => "pull",
            ScenarioKind::ProfileExchange => "profile-exchange",
        }
    }

    /// Human-readable role name within this scenario.
    pub fn role_label(&self, role: Role) -> &'static str {
        match (self, role) {
            (ScenarioKind::Push | ScenarioKind::Pull, Role::Responder) => "remote",
            (ScenarioKind::Push, Role::Initiator) => "pusher",
            (ScenarioKind::Pull, Role::Initiator) => "puller",
            (ScenarioKind::ProfileExchange, Role::Responder) => "connector",
            (ScenarioKind::ProfileExchange, Role::Initiator) => "listener",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(ScenarioKind::Push),
            "pull" => Ok(ScenarioKind::Pull),
            "profile-exchange" | "profile_exchange" => Ok(ScenarioKind::ProfileExchange),
            other => Err(PlanError::UnknownScenario(other.to_string())),
        }
    }
}

/// Scenario progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScenarioState {
    Idle,
    NetworkReady,
    RoleAssigned,
    Constructed,
    InfoShared,
    Acting,
    Done,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioState::Idle => "idle",
            ScenarioState::NetworkReady => "network-ready",
            ScenarioState::RoleAssigned => "role-assigned",
            ScenarioState::Constructed => "constructed",
            ScenarioState::InfoShared => "info-shared",
            ScenarioState::Acting => "acting",
            ScenarioState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Tracks and logs one node's scenario state.
#[derive(Debug)]
pub struct ScenarioProgress {
    kind: ScenarioKind,
    state: ScenarioState,
}

impl ScenarioProgress {
    pub fn new(kind: ScenarioKind) -> Self {
        Self {
            kind,
            state: ScenarioState::Idle,
        }
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn advance(&mut self, next: ScenarioState) {
        info!("[{}] {} -> {}", self.kind, self.state, next);
        self.state = next;
    }
}

/// How one node's run ended.
#[derive(Debug)]
pub struct NodeReport {
    pub kind: ScenarioKind,

    /// Assigned sequence number, if the node joined
    pub seq: Option<u64>,

    /// Role, if one was assigned
    pub role: Option<Role>,

    /// Peers known after info exchange
    pub peer_count: usize,

    /// Last state reached
    pub state: ScenarioState,

    pub outcome: Result<(), PlanError>,
}

impl NodeReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn role_label(&self) -> Option<&'static str> {
        self.role.map(|role| self.kind.role_label(role))
    }
}

/// Runs the test case named by `env` for one node.
pub async fn run_scenario(
    env: RunEnv,
    sync: Arc<dyn SyncService>,
    shaper: Option<Arc<dyn NetworkShaper>>,
    parts: ActorParts,
) -> NodeReport {
    let kind = match env.test_case.parse::<ScenarioKind>() {
        Ok(kind) => kind,
        Err(err) => {
            error!("{}", err);
            return NodeReport {
                kind: ScenarioKind::Push,
                seq: None,
                role: None,
                peer_count: 0,
                state: ScenarioState::Idle,
                outcome: Err(err),
            };
        }
    };
    let mut progress = ScenarioProgress::new(kind);
    let mut report = NodeReport {
        kind,
        seq: None,
        role: None,
        peer_count: 0,
        state: ScenarioState::Idle,
        outcome: Ok(()),
    };

    // Configuration errors must surface before any barrier is entered
    let prepared = PlanConfig::from_env(&env).and_then(|config| {
        let roles = RoleAssigner::new(config.ratio, env.instance_count)?;
        Ok((config, roles))
    });
    let (config, roles) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            error!("invalid configuration: {}", err);
            report.outcome = Err(err);
            return report;
        }
    };

    let mut plan = match Plan::join(env, config, sync, shaper, parts).await {
        Ok(plan) => plan,
        Err(err) => {
            error!("failed to join run: {}", err);
            report.outcome = Err(err);
            return report;
        }
    };
    report.seq = Some(plan.seq());

    let result = drive(kind, &mut plan, &roles, &mut progress, &mut report).await;
    if let Err(err) = &result {
        error!("[{}] aborted in {}: {}", kind, progress.state(), err);
    }
    report.peer_count = plan.peers().len();
    report.state = progress.state();
    report.outcome = plan.conclude(result).await;
    report
}

async fn drive(
    kind: ScenarioKind,
    plan: &mut Plan,
    roles: &RoleAssigner,
    progress: &mut ScenarioProgress,
    report: &mut NodeReport,
) -> Result<(), PlanError> {
    plan.setup_network().await?;
    progress.advance(ScenarioState::NetworkReady);

    let role = roles.role(plan.seq());
    report.role = Some(role);
    info!("seq {} is a {}", plan.seq(), kind.role_label(role));
    progress.advance(ScenarioState::RoleAssigned);

    match kind {
        ScenarioKind::Push => remote_transfer::run(plan, roles, role, TransferMode::Push, progress).await,
        ScenarioKind::Pull => remote_transfer::run(plan, roles, role, TransferMode::Pull, progress).await,
        ScenarioKind::ProfileExchange => profile_exchange::run(plan, roles, role, progress).await,
    }
}

/// Completion shared by every scenario.
async fn finish(plan: &mut Plan, progress: &mut ScenarioProgress) -> Result<(), PlanError> {
    plan.actor_finished().await?;
    plan.finished().await?;
    progress.advance(ScenarioState::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDatasets, FakeTransport};
    use testplan_env::{LocalSyncService, ProfileId};

    #[test]
    fn test_kind_parse() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.name().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert!(matches!(
            "gossip".parse::<ScenarioKind>(),
            Err(PlanError::UnknownScenario(_))
        ));
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(ScenarioKind::Push.role_label(Role::Initiator), "pusher");
        assert_eq!(ScenarioKind::Pull.role_label(Role::Responder), "remote");
        assert_eq!(ScenarioKind::ProfileExchange.role_label(Role::Responder), "connector");
    }

    #[tokio::test]
    async fn test_invalid_ratio_fails_before_any_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let env = RunEnv::new("push", 2).with_param("pushersPerReceiver", 2);
        let parts = ActorParts {
            peername: "peer_0".to_string(),
            profile_id: ProfileId::from_seed(0),
            transport: Arc::new(FakeTransport::new(0)),
            datasets: FakeDatasets::new("peer_0"),
            repo_dir: dir.path().to_path_buf(),
        };

        let report = run_scenario(env, Arc::new(service.client()), None, parts).await;

        assert!(matches!(report.outcome, Err(PlanError::InvalidRatio { ratio: 2, instances: 2 })));
        assert_eq!(report.seq, None);
        assert_eq!(service.count(&crate::states::ASSIGN_SEQ), 0);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let env = RunEnv::new("push", 2).with_param("timeout_secs", i64::MAX);
        let parts = ActorParts {
            peername: "peer_0".to_string(),
            profile_id: ProfileId::from_seed(0),
            transport: Arc::new(FakeTransport::new(0)),
            datasets: FakeDatasets::new("peer_0"),
            repo_dir: dir.path().to_path_buf(),
        };

        let report = run_scenario(env, Arc::new(service.client()), None, parts).await;

        assert!(matches!(report.outcome, Err(PlanError::InvalidParam { ref name, .. }) if name == "timeout_secs"));
        assert_eq!(service.count(&crate::states::ASSIGN_SEQ), 0);
    }
}
