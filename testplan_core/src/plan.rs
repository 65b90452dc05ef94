//! The coordinator: one node's walk through the phases of a run.
//!
//! Phases run in a fixed order and every out-of-order call is an error:
//!
//! ```text
//! join -> setup_network -> construct_actor -> share_info -> (scenario)
//!      -> actor_finished -> finished -> close
//! ```
//!
//! Every wait is bounded by the run deadline computed at join time.

use crate::actor::{Actor, ActorConstructor, ActorParts};
use crate::config::{PlanConfig, RunContext, RunEnv, MAX_TIMEOUT_SECS};
use crate::error::PlanError;
use crate::exchange::{ActorInfoExchange, PeerTable};
use crate::failure::{AggregatedError, FailureAggregator};
use crate::states::{
    network_topic, ACTOR_CONSTRUCTED, ASSIGN_SEQ, FINISHED, NETWORK_CONFIGURED, NETWORK_INITIALIZED,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use testplan_env::{
    Barrier, EnvError, LinkShape, NetworkConfig, NetworkShaper, StateName, SyncService, SyncServiceExt,
};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Joined,
    NetworkReady,
    Constructed,
    InfoShared,
    Finished,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Joined => "joined",
            Phase::NetworkReady => "network-ready",
            Phase::Constructed => "constructed",
            Phase::InfoShared => "info-shared",
            Phase::Finished => "finished",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Instant `after` from now, capped at [`MAX_TIMEOUT_SECS`].
pub(crate) fn deadline_in(after: Duration) -> Instant {
    let after = after.min(Duration::from_secs(MAX_TIMEOUT_SECS));
    let now = Instant::now();
    now.checked_add(after).unwrap_or(now)
}

/// Runs `fut` unless `deadline` passes first.
pub(crate) async fn within<T, F>(deadline: Instant, phase: &str, fut: F) -> Result<T, PlanError>
where
    F: Future<Output = Result<T, PlanError>>,
{
    let started = Instant::now();
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(PlanError::timeout(phase, deadline.saturating_duration_since(started))),
    }
}

/// Takes a 0-based sequence number and creates the `finished` barrier.
async fn assign_seq(
    sync: &dyn SyncService,
    instances: u64,
    deadline: Instant,
) -> Result<(u64, Barrier), PlanError> {
    if instances == 0 {
        return Err(PlanError::BarrierTarget {
            state: ASSIGN_SEQ,
            target: instances,
            instances,
        });
    }
    let count = within(deadline, ASSIGN_SEQ.as_str(), async {
        Ok(sync.signal_and_wait(&ASSIGN_SEQ, instances).await?)
    })
    .await?;
    let finished = sync.barrier(&FINISHED, instances).await?;
    Ok((count - 1, finished))
}

/// One node's coordinator.
pub struct Plan {
    ctx: RunContext,
    sync: Arc<dyn SyncService>,
    shaper: Option<Arc<dyn NetworkShaper>>,
    deadline: Instant,
    finished: Option<Barrier>,
    parts: Option<ActorParts>,
    actor: Option<Actor>,
    peers: PeerTable,
    phase: Phase,
    failures: FailureAggregator,
}

impl Plan {
    /// Joins the run: gets a sequence number and arms the `finished` barrier.
    ///
    /// On failure the sync client is closed before returning.
    pub async fn join(
        env: RunEnv,
        config: PlanConfig,
        sync: Arc<dyn SyncService>,
        shaper: Option<Arc<dyn NetworkShaper>>,
        parts: ActorParts,
    ) -> Result<Self, PlanError> {
        let deadline = deadline_in(config.timeout);
        let instances = env.instance_count;

        let (seq, finished) = match assign_seq(sync.as_ref(), instances, deadline).await {
            Ok(joined) => joined,
            Err(err) => {
                if let Err(close_err) = sync.close().await {
                    warn!("closing sync client after failed join: {}", close_err);
                }
                return Err(err);
            }
        };

        info!(
            "joined {:?} as seq {} of {} (timeout {:?})",
            env.test_case, seq, instances, config.timeout
        );

        Ok(Self {
            ctx: RunContext { seq, env, config },
            sync,
            shaper,
            deadline,
            finished: Some(finished),
            parts: Some(parts),
            actor: None,
            peers: PeerTable::default(),
            phase: Phase::Joined,
            failures: FailureAggregator::new(),
        })
    }

    pub fn seq(&self) -> u64 {
        self.ctx.seq
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn config(&self) -> &PlanConfig {
        &self.ctx.config
    }

    pub fn instances(&self) -> u64 {
        self.ctx.env.instance_count
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn sync(&self) -> &dyn SyncService {
        self.sync.as_ref()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn actor(&self) -> Result<&Actor, PlanError> {
        self.actor.as_ref().ok_or(PlanError::NoActor)
    }

    pub fn actor_mut(&mut self) -> Result<&mut Actor, PlanError> {
        self.actor.as_mut().ok_or(PlanError::NoActor)
    }

    /// Number of non-fatal failures recorded so far.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    fn enter(&self, expected: Phase, attempted: Phase) -> Result<(), PlanError> {
        if self.phase != expected {
            return Err(PlanError::PhaseOrder {
                attempted,
                current: self.phase,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: Phase) {
        info!("phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    fn check_target(&self, state: &StateName, target: u64) -> Result<(), PlanError> {
        let instances = self.instances();
        if target == 0 || target > instances {
            error!("barrier {} target {} outside 1..={}", state, target, instances);
            return Err(PlanError::BarrierTarget {
                state: state.clone(),
                target,
                instances,
            });
        }
        Ok(())
    }

    /// Signals entry into `state`; returns the 1-based count.
    pub async fn signal(&self, state: &StateName) -> Result<u64, PlanError> {
        Ok(self.sync.signal_entry(state).await?)
    }

    /// Waits for `state` to reach `target`.
    ///
    /// Bounded by the run deadline, and by `sub_timeout` when given.
    pub async fn wait_state(
        &self,
        state: &StateName,
        target: u64,
        sub_timeout: Option<Duration>,
    ) -> Result<(), PlanError> {
        self.check_target(state, target)?;
        let until = match sub_timeout {
            Some(sub) => self.deadline.min(deadline_in(sub)),
            None => self.deadline,
        };
        within(until, state.as_str(), async {
            self.sync.barrier(state, target).await?.wait().await?;
            Ok(())
        })
        .await
    }

    /// Signals `state` and waits for it to reach `target`.
    pub async fn signal_and_wait(&self, state: &StateName, target: u64) -> Result<u64, PlanError> {
        self.check_target(state, target)?;
        within(self.deadline, state.as_str(), async {
            Ok(self.sync.signal_and_wait(state, target).await?)
        })
        .await
    }

    /// Phase 1: network setup. A no-op without network control.
    pub async fn setup_network(&mut self) -> Result<(), PlanError> {
        self.enter(Phase::Joined, Phase::NetworkReady)?;

        if !self.ctx.env.sidecar {
            info!("no network control, skipping network setup");
            self.transition(Phase::NetworkReady);
            return Ok(());
        }

        let shaper = self
            .shaper
            .clone()
            .ok_or_else(|| EnvError::network("network control requested without a shaper"))?;
        let n = self.instances();

        self.signal_and_wait(&NETWORK_INITIALIZED, n).await?;

        let config = NetworkConfig {
            network: "default".to_string(),
            enable: true,
            default: LinkShape {
                latency: self.ctx.config.latency,
                bandwidth: self.ctx.config.bandwidth,
            },
            callback_state: NETWORK_CONFIGURED,
        };
        self.sync.publish(&network_topic(&self.ctx.env.hostname), &config).await?;
        within(self.deadline, "network shaping", async {
            Ok(shaper.apply(&config).await?)
        })
        .await?;
        self.signal_and_wait(&config.callback_state, n).await?;

        info!("network configured: latency {:?}", config.default.latency);
        self.transition(Phase::NetworkReady);
        Ok(())
    }

    /// Phase 2: runs `constructor`, then the construction barrier.
    ///
    /// A constructor error is returned only after the barrier.
    pub async fn construct_actor(&mut self, constructor: &dyn ActorConstructor) -> Result<(), PlanError> {
        self.enter(Phase::NetworkReady, Phase::Constructed)?;
        let parts = self.parts.take().ok_or(PlanError::NoActor)?;

        let constructed = constructor.construct(&self.ctx, parts).await;
        if let Err(err) = &constructed {
            error!("actor construction failed: {}", err);
        }

        self.signal_and_wait(&ACTOR_CONSTRUCTED, self.instances()).await?;

        self.actor = Some(constructed?);
        self.transition(Phase::Constructed);
        Ok(())
    }

    /// Phase 3: info exchange.
    pub async fn share_info(&mut self) -> Result<(), PlanError> {
        self.enter(Phase::Constructed, Phase::InfoShared)?;
        let actor = self.actor()?;
        let own = actor.info(self.seq());

        let table = ActorInfoExchange::new(
            self.sync.as_ref(),
            actor.transport().as_ref(),
            self.instances(),
            self.deadline,
        )
        .run(&own)
        .await?;

        self.peers = table;
        self.transition(Phase::InfoShared);
        Ok(())
    }

    /// Phase 5a: signals that this node's scenario action is over.
    pub async fn actor_finished(&mut self) -> Result<(), PlanError> {
        self.enter(Phase::InfoShared, Phase::Finished)?;
        let count = self.signal(&FINISHED).await?;
        info!("actor finished ({}/{})", count, self.instances());
        self.transition(Phase::Finished);
        Ok(())
    }

    /// Phase 5b: waits until every node has finished.
    pub async fn finished(&mut self) -> Result<(), PlanError> {
        if self.phase != Phase::Finished {
            return Err(PlanError::PhaseOrder {
                attempted: Phase::Finished,
                current: self.phase,
            });
        }
        let barrier = self.finished.take().ok_or(PlanError::PhaseOrder {
            attempted: Phase::Finished,
            current: self.phase,
        })?;
        within(self.deadline, FINISHED.as_str(), async move { Ok(barrier.wait().await?) }).await?;
        info!("all {} nodes finished", self.instances());
        Ok(())
    }

    /// Records a non-fatal failure.
    pub fn record_failure(&mut self, failure: impl fmt::Display) {
        warn!("{}", failure);
        self.failures.record(failure);
    }

    /// Records every failure of a fan-out.
    pub fn record_failures(&mut self, failures: AggregatedError) {
        for failure in failures.failures() {
            warn!("{}", failure);
        }
        self.failures.absorb(failures);
    }

    /// Stops the actor and closes the sync client. Later calls do nothing.
    pub async fn close(&mut self) -> Result<(), PlanError> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        if let Some(actor) = self.actor.as_mut() {
            actor.stop().await;
        }
        self.transition(Phase::Closed);
        self.sync.close().await?;
        Ok(())
    }

    /// Closes the plan and folds recorded failures into the node's outcome.
    pub async fn conclude(mut self, result: Result<(), PlanError>) -> Result<(), PlanError> {
        if let Err(err) = self.close().await {
            warn!("closing sync client: {}", err);
        }

        let partial = std::mem::take(&mut self.failures).into_error();
        match (result, partial) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(partial)) => Err(PlanError::Partial(partial)),
            (Err(cause), None) => Err(cause),
            (Err(cause), Some(partial)) => Err(PlanError::Aborted {
                cause: Box::new(cause),
                partial,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTable;
    use crate::testing::{FakeDatasets, FakeTransport};
    use async_trait::async_trait;
    use testplan_env::{LocalSyncService, ProfileId};

    struct Plain;

    #[async_trait]
    impl ActorConstructor for Plain {
        async fn construct(&self, _ctx: &RunContext, parts: ActorParts) -> Result<Actor, PlanError> {
            Ok(Actor::start(parts, EventTable::new()))
        }
    }

    struct Broken;

    #[async_trait]
    impl ActorConstructor for Broken {
        async fn construct(&self, _ctx: &RunContext, _parts: ActorParts) -> Result<Actor, PlanError> {
            Err(PlanError::Construction("no repo".to_string()))
        }
    }

    fn parts(index: u64, dir: &std::path::Path) -> ActorParts {
        let peername = format!("peer_{index}");
        ActorParts {
            datasets: FakeDatasets::new(&peername),
            peername,
            profile_id: ProfileId::from_seed(index),
            transport: Arc::new(FakeTransport::new(index)),
            repo_dir: dir.join(index.to_string()),
        }
    }

    async fn join_all_nodes(service: &LocalSyncService, n: u64, dir: &std::path::Path) -> Vec<Plan> {
        let joins = (0..n).map(|i| {
            let sync: Arc<dyn SyncService> = Arc::new(service.client());
            Plan::join(
                RunEnv::new("push", n),
                PlanConfig::default().with_timeout(Duration::from_secs(30)),
                sync,
                None,
                parts(i, dir),
            )
        });
        futures::future::join_all(joins)
            .await
            .into_iter()
            .map(|plan| plan.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_join_assigns_dense_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let plans = join_all_nodes(&service, 4, dir.path()).await;

        let mut seqs: Vec<_> = plans.iter().map(Plan::seq).collect();
        seqs.sort();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert!(plans.iter().all(|p| p.phase() == Phase::Joined));
    }

    #[tokio::test]
    async fn test_full_phase_walk() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let plans = join_all_nodes(&service, 3, dir.path()).await;

        let walks = plans.into_iter().map(|mut plan| async move {
            plan.setup_network().await?;
            plan.construct_actor(&Plain).await?;
            plan.share_info().await?;
            assert_eq!(plan.peers().len(), 2);
            plan.actor_finished().await?;
            plan.finished().await?;
            plan.conclude(Ok(())).await
        });

        for result in futures::future::join_all(walks).await {
            result.unwrap();
        }
        assert_eq!(service.count(&FINISHED), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_phase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let mut plan = join_all_nodes(&service, 1, dir.path()).await.remove(0);

        let err = plan.share_info().await.unwrap_err();
        assert!(matches!(
            err,
            PlanError::PhaseOrder {
                attempted: Phase::InfoShared,
                current: Phase::Joined
            }
        ));
    }

    #[tokio::test]
    async fn test_constructor_error_after_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let mut plans = join_all_nodes(&service, 2, dir.path()).await;
        let mut good = plans.pop().unwrap();
        let mut bad = plans.pop().unwrap();

        good.setup_network().await.unwrap();
        bad.setup_network().await.unwrap();

        let (good_result, bad_result) = tokio::join!(good.construct_actor(&Plain), bad.construct_actor(&Broken));

        // The good node was released, so the failing node did enter the barrier
        good_result.unwrap();
        assert!(matches!(bad_result, Err(PlanError::Construction(_))));
        assert_eq!(service.count(&ACTOR_CONSTRUCTED), 2);
        assert_eq!(bad.phase(), Phase::NetworkReady);
    }

    #[tokio::test]
    async fn test_barrier_target_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let plan = join_all_nodes(&service, 2, dir.path()).await.remove(0);

        let state = StateName::from_static("some state");
        assert!(matches!(
            plan.wait_state(&state, 3, None).await,
            Err(PlanError::BarrierTarget { target: 3, .. })
        ));
        assert!(matches!(
            plan.wait_state(&state, 0, None).await,
            Err(PlanError::BarrierTarget { target: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_state_sub_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let plan = join_all_nodes(&service, 2, dir.path()).await.remove(0);

        let state = StateName::from_static("never reached");
        let err = plan
            .wait_state(&state, 2, Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Timeout { ref phase, .. } if phase == "never reached"));
    }

    #[tokio::test]
    async fn test_conclude_combines_failures() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let mut plans = join_all_nodes(&service, 2, dir.path()).await;

        let mut partial = plans.pop().unwrap();
        partial.record_failure("error pushing to a");
        partial.record_failure("error pushing to b");
        match partial.conclude(Ok(())).await {
            Err(PlanError::Partial(agg)) => assert_eq!(agg.to_string(), "error pushing to a\nerror pushing to b"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let mut aborted = plans.pop().unwrap();
        aborted.record_failure("error pushing to a");
        let err = aborted.conclude(Err(PlanError::NoActor)).await.unwrap_err();
        assert!(matches!(err, PlanError::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let mut plan = join_all_nodes(&service, 1, dir.path()).await.remove(0);

        plan.close().await.unwrap();
        plan.close().await.unwrap();
        assert_eq!(plan.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_join_fails_when_service_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        service.shutdown("gone");

        let sync: Arc<dyn SyncService> = Arc::new(service.client());
        let err = Plan::join(RunEnv::new("push", 2), PlanConfig::default(), sync, None, parts(0, dir.path()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlanError::Env(EnvError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_oversized_timeout_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let service = LocalSyncService::new();
        let sync: Arc<dyn SyncService> = Arc::new(service.client());
        let config = PlanConfig::default().with_timeout(Duration::MAX);

        let plan = Plan::join(RunEnv::new("push", 1), config, sync, None, parts(0, dir.path()))
            .await
            .unwrap();

        assert!(plan.deadline() <= Instant::now() + Duration::from_secs(MAX_TIMEOUT_SECS));
        plan.wait_state(&ASSIGN_SEQ, 1, Some(Duration::MAX)).await.unwrap();
    }
}
