//! Push and pull scenarios.
//!
//! Responders act as remotes. In push mode each initiator saves a dataset
//! version and pushes it to every remote; in pull mode every remote saves
//! one during construction and each initiator pulls from every remote.
//! Remotes wait until every initiator has attempted its transfers.

use super::{finish, ScenarioProgress, ScenarioState};
use crate::actor::{Actor, ActorConstructor, ActorParts};
use crate::config::RunContext;
use crate::dataset::DATASET_NAME;
use crate::error::PlanError;
use crate::events::{EventTable, LogConnections};
use crate::failure::{fan_out, FailureAggregator};
use crate::plan::Plan;
use crate::role::{Role, RoleAssigner};
use crate::states::{PULL_ATTEMPTED, PUSH_ATTEMPTED};
use async_trait::async_trait;
use std::sync::Arc;
use testplan_env::{ConnectionEventKind, DatasetRef, EnvError, ProfileId, RemoteHooks, StateName};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Push,
    Pull,
}

impl TransferMode {
    /// State initiators signal once every transfer was attempted.
    pub fn attempted_state(&self) -> StateName {
        match self {
            TransferMode::Push => PUSH_ATTEMPTED,
            TransferMode::Pull => PULL_ATTEMPTED,
        }
    }

    /// Role that saves the dataset during construction.
    pub fn data_holder(&self) -> Role {
        match self {
            TransferMode::Push => Role::Initiator,
            TransferMode::Pull => Role::Responder,
        }
    }
}

/// Logs transfers served by a remote.
pub struct TransferRemoteHooks {
    peername: String,
}

impl TransferRemoteHooks {
    pub fn new(peername: impl Into<String>) -> Self {
        Self {
            peername: peername.into(),
        }
    }
}

impl RemoteHooks for TransferRemoteHooks {
    fn push_pre_check(&self, from: &ProfileId, reference: &DatasetRef) -> Result<(), EnvError> {
        info!("{}: accepting push of {} from {}", self.peername, reference, from);
        Ok(())
    }

    fn dataset_pushed(&self, from: &ProfileId, reference: &DatasetRef) {
        info!("{}: dataset {} pushed by {}", self.peername, reference, from);
    }

    fn dataset_pulled(&self, by: &ProfileId, reference: &DatasetRef) {
        info!("{}: dataset {} pulled by {}", self.peername, reference, by);
    }
}

/// Builds push/pull actors.
pub struct TransferActorConstructor {
    mode: TransferMode,
    roles: RoleAssigner,
}

impl TransferActorConstructor {
    pub fn new(mode: TransferMode, roles: RoleAssigner) -> Self {
        Self { mode, roles }
    }
}

#[async_trait]
impl ActorConstructor for TransferActorConstructor {
    async fn construct(&self, ctx: &RunContext, parts: ActorParts) -> Result<Actor, PlanError> {
        let role = self.roles.role(ctx.seq);
        let table = EventTable::new().on(
            ConnectionEventKind::PeerConnected,
            Arc::new(LogConnections {
                peername: parts.peername.clone(),
            }),
        );
        let mut actor = Actor::start(parts, table);

        if role == Role::Responder {
            actor
                .datasets()
                .enable_remote(Arc::new(TransferRemoteHooks::new(actor.peername())));
        }
        if role == self.mode.data_holder() {
            actor
                .generate_dataset_version(DATASET_NAME, ctx.config.dataset_size, ctx.seq)
                .await?;
        }
        Ok(actor)
    }
}

pub(super) async fn run(
    plan: &mut Plan,
    roles: &RoleAssigner,
    role: Role,
    mode: TransferMode,
    progress: &mut ScenarioProgress,
) -> Result<(), PlanError> {
    plan.construct_actor(&TransferActorConstructor::new(mode, *roles)).await?;
    progress.advance(ScenarioState::Constructed);

    plan.share_info().await?;
    progress.advance(ScenarioState::InfoShared);

    progress.advance(ScenarioState::Acting);
    let attempted = mode.attempted_state();
    match role {
        Role::Initiator => {
            let failures = match mode {
                TransferMode::Push => push_to_remotes(plan, roles).await?,
                TransferMode::Pull => pull_from_remotes(plan, roles).await?,
            };
            if let Some(failures) = failures.into_error() {
                plan.record_failures(failures);
            }
            let count = plan.signal(&attempted).await?;
            info!("signalled {:?} ({}/{})", attempted.as_str(), count, roles.initiator_count());
        }
        Role::Responder => {
            let timeout = plan.config().scenario_timeout;
            match plan.wait_state(&attempted, roles.initiator_count(), Some(timeout)).await {
                Ok(()) => info!("all {} initiators attempted their transfers", roles.initiator_count()),
                Err(err) if err.is_timeout() => {
                    plan.record_failure(format!("waiting for {:?}: {}", attempted.as_str(), err));
                }
                Err(err) => return Err(err),
            }
        }
    }

    match foreign_logs(plan).await {
        Ok(count) => info!("holding {} foreign dataset logs", count),
        Err(err) => plan.record_failure(format!("listing dataset logs: {err}")),
    }

    finish(plan, progress).await
}

async fn push_to_remotes(plan: &Plan, roles: &RoleAssigner) -> Result<FailureAggregator, PlanError> {
    let actor = plan.actor()?;
    let reference = actor
        .latest_version()
        .cloned()
        .ok_or_else(|| PlanError::Construction("no dataset version to push".to_string()))?;
    let datasets = actor.datasets();

    let remotes = plan.peers().with_role(roles, Role::Responder);
    for remote in &remotes {
        datasets.set_remote(&remote.peername, remote.peer_id());
    }

    let reference = &reference;
    let failures = fan_out(remotes, |remote| async move {
        match datasets.push_to_remote(reference, &remote.peername).await {
            Ok(()) => {
                info!("pushed {} to {}", reference, remote.peername);
                Ok(())
            }
            Err(err) => Err(format!("error pushing \"{}\" to \"{}\": {}", reference, remote.peername, err)),
        }
    })
    .await;
    Ok(failures)
}

async fn pull_from_remotes(plan: &Plan, roles: &RoleAssigner) -> Result<FailureAggregator, PlanError> {
    let actor = plan.actor()?;
    let datasets = actor.datasets();
    let transport = actor.transport();

    let remotes = plan.peers().with_role(roles, Role::Responder);
    let failures = fan_out(remotes, |remote| async move {
        let reference = DatasetRef::named(&remote.peername, DATASET_NAME);
        let Some(addr) = transport.addrs(remote.peer_id()).into_iter().next() else {
            return Err(format!(
                "error pulling \"{}\" from \"{}\": no known address",
                reference, remote.peername
            ));
        };
        match datasets.pull_from_remote(&reference, &addr).await {
            Ok(()) => {
                info!("pulled {} from {}", reference, addr);
                Ok(())
            }
            Err(err) => Err(format!("error pulling \"{}\" from \"{}\": {}", reference, remote.peername, err)),
        }
    })
    .await;
    Ok(failures)
}

/// Logs every dataset authored by someone else and returns how many.
async fn foreign_logs(plan: &Plan) -> Result<usize, PlanError> {
    let actor = plan.actor()?;
    let logs = actor.datasets().list_logs().await?;

    let mut count = 0;
    for log in logs.iter().filter(|log| log.author != actor.peername()) {
        info!("log {}/{} with {} versions", log.author, log.name, log.versions.len());
        count += 1;
    }
    Ok(count)
}
