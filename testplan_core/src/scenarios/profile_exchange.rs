//! Profile exchange scenario.
//!
//! Connectors dial every peer and open a profile stream to it. Every node
//! runs a connection watcher counting the distinct profiles it exchanged
//! with: a connector expects every other member of its group, a listener
//! expects every connector.

use super::{finish, ScenarioProgress, ScenarioState};
use crate::actor::{Actor, ActorConstructor, ActorParts};
use crate::config::RunContext;
use crate::error::PlanError;
use crate::events::{EventTable, ForwardProfileConnections, LogConnections};
use crate::failure::{fan_out, FailureAggregator};
use crate::plan::Plan;
use crate::role::{Role, RoleAssigner};
use crate::states::PROFILES_RECEIVED;
use crate::watcher::ConnectionWatcher;
use async_trait::async_trait;
use std::sync::Arc;
use testplan_env::ConnectionEventKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Protocol opened by connectors to trigger a profile exchange.
pub const PROFILE_PROTOCOL: &str = "/testplan/profile/0.1.0";

/// Builds actors that forward profile connections to a watcher.
pub struct ProfileExchangeConstructor;

#[async_trait]
impl ActorConstructor for ProfileExchangeConstructor {
    async fn construct(&self, _ctx: &RunContext, parts: ActorParts) -> Result<Actor, PlanError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(LogConnections {
            peername: parts.peername.clone(),
        });
        let table = EventTable::new()
            .on(ConnectionEventKind::PeerConnected, log.clone())
            .on(ConnectionEventKind::ProfileConnected, log)
            .on(
                ConnectionEventKind::ProfileConnected,
                Arc::new(ForwardProfileConnections::new(tx)),
            );
        Ok(Actor::start(parts, table).with_profile_events(rx))
    }
}

/// Distinct profiles a node of `role` should see.
pub(crate) fn watch_target(ctx: &RunContext, roles: &RoleAssigner, role: Role) -> usize {
    match role {
        Role::Responder => ctx.group_instance_count().saturating_sub(1) as usize,
        Role::Initiator => roles.responder_count() as usize,
    }
}

pub(super) async fn run(
    plan: &mut Plan,
    roles: &RoleAssigner,
    role: Role,
    progress: &mut ScenarioProgress,
) -> Result<(), PlanError> {
    plan.construct_actor(&ProfileExchangeConstructor).await?;
    progress.advance(ScenarioState::Constructed);

    plan.share_info().await?;
    progress.advance(ScenarioState::InfoShared);

    progress.advance(ScenarioState::Acting);
    let target = watch_target(plan.ctx(), roles, role);
    let profiles = plan
        .actor_mut()?
        .take_profile_events()
        .ok_or_else(|| PlanError::Construction("actor has no profile event stream".to_string()))?;

    let cancel = CancellationToken::new();
    let _stop_watcher = cancel.clone().drop_guard();
    let watcher = ConnectionWatcher::new(target, plan.config().scenario_timeout).spawn(profiles, cancel);
    info!("watching for {} profiles", target);

    if role == Role::Responder {
        if let Some(failures) = connect_to_peers(plan).await?.into_error() {
            plan.record_failures(failures);
        }
    }

    let report = watcher.await.map_err(|err| PlanError::Task(err.to_string()))?;
    match report.into_result() {
        Ok(seen) => info!("exchanged profiles with {} peers", seen.len()),
        Err(err) => plan.record_failure(err),
    }

    for (profile_id, peername) in plan.actor()?.transport().known_profiles() {
        info!("known profile {} ({})", peername, profile_id);
    }

    plan.signal_and_wait(&PROFILES_RECEIVED, plan.instances()).await?;

    finish(plan, progress).await
}

async fn connect_to_peers(plan: &Plan) -> Result<FailureAggregator, PlanError> {
    let transport = plan.actor()?.transport();

    let failures = fan_out(plan.peers().by_seq(), |peer| async move {
        if let Err(err) = transport.connect(&peer.endpoint).await {
            return Err(format!("error connecting to \"{}\": {}", peer.peername, err));
        }
        transport
            .open_stream(peer.peer_id(), PROFILE_PROTOCOL)
            .await
            .map_err(|err| format!("error exchanging profiles with \"{}\": {}", peer.peername, err))
    })
    .await;
    Ok(failures)
}
