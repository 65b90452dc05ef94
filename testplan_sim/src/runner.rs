//! Scenario runner - executes a whole run of N nodes in one process.

use crate::dataset::TransferRecord;
use crate::scenarios::{BuiltinFault, ScenarioId};
use crate::world::SimWorld;
use futures::future::{join_all, ready, Either};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use testplan_core::states::ASSIGN_SEQ;
use testplan_core::{run_scenario, NodeReport, PlanError, RunEnv, ScenarioState};
use testplan_env::{DatasetEngine, PeerTransport};
use tracing::{debug, info, info_span, warn, Instrument};

/// How one node ended.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub index: u64,
    pub peername: String,

    /// Sequence number assigned at join
    pub seq: Option<u64>,

    /// Scenario role label (remote, pusher, connector, ...)
    pub role: Option<String>,

    /// Last scenario state reached
    pub state: String,

    /// Peers learned during info exchange
    pub peers: usize,

    /// Distinct profiles exchanged
    pub profiles: usize,

    /// Dataset logs authored by other nodes
    pub foreign_logs: usize,

    /// Recorded non-fatal failures
    pub failures: Vec<String>,

    /// Fatal error, if the node aborted
    pub fatal: Option<String>,
}

impl NodeSummary {
    pub fn finished(&self) -> bool {
        self.fatal.is_none() && self.state == ScenarioState::Done.to_string()
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether every node finished without a fatal error
    pub passed: bool,

    /// Wall-clock duration
    pub elapsed_ms: u128,

    /// Per-node outcomes, by node index
    pub nodes: Vec<NodeSummary>,

    /// Every dataset transfer attempted
    pub transfers: Vec<TransferRecord>,

    /// Failure message if any
    pub failure_reason: Option<String>,
}

impl ScenarioResult {
    /// Recorded non-fatal failures across all nodes.
    pub fn failure_count(&self) -> usize {
        self.nodes.iter().map(|n| n.failures.len()).sum()
    }

    pub fn node_by_seq(&self, seq: u64) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.seq == Some(seq))
    }

    pub fn nodes_with_role(&self, role: &str) -> impl Iterator<Item = &NodeSummary> {
        let role = role.to_string();
        self.nodes.iter().filter(move |n| n.role.as_deref() == Some(role.as_str()))
    }
}

/// Runs scenarios against a fresh [`SimWorld`].
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of nodes
    num_nodes: usize,

    /// Parameters handed to every node
    params: BTreeMap<String, String>,

    /// Faults injected on top of the scenario's own
    faults: Vec<BuiltinFault>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_nodes: usize) -> Self {
        let mut params = BTreeMap::new();
        params.insert("timeout_secs".to_string(), "120".to_string());
        params.insert("scenario_timeout_secs".to_string(), "30".to_string());
        Self {
            seed,
            num_nodes,
            params,
            faults: Vec::new(),
        }
    }

    /// Sets a raw run parameter.
    pub fn with_param(mut self, name: &str, value: impl ToString) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }

    /// Sets the role ratio.
    pub fn with_ratio(self, ratio: u64) -> Self {
        self.with_param("ratio", ratio)
    }

    /// Sets the generated dataset size.
    pub fn with_dataset_size(self, rows: usize) -> Self {
        self.with_param("datasetSize", rows)
    }

    /// Sets the run timeout.
    pub fn with_timeout(self, secs: u64) -> Self {
        self.with_param("timeout_secs", secs)
    }

    /// Sets the scenario sub-timeout.
    pub fn with_scenario_timeout(self, secs: u64) -> Self {
        self.with_param("scenario_timeout_secs", secs)
    }

    /// Partitions node `a` from node `b`.
    pub fn with_partition(mut self, a: usize, b: usize) -> Self {
        self.faults.push(BuiltinFault::Partition(a, b));
        self
    }

    /// Makes node `index` reject every transfer it serves.
    pub fn with_rejecting(mut self, index: usize) -> Self {
        self.faults.push(BuiltinFault::RejectTransfers(index));
        self
    }

    /// Drops messages from node `from` to node `to` at `rate`.
    pub fn with_loss(mut self, from: usize, to: usize, rate: f64) -> Self {
        self.faults.push(BuiltinFault::Loss(from, to, rate));
        self
    }

    /// Runs the nodes under network control with this link latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.faults.push(BuiltinFault::Latency(latency_ms));
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}, nodes={})",
            scenario.name(),
            self.seed,
            self.num_nodes
        );
        let started = Instant::now();

        let mut world = SimWorld::new(self.seed);
        world.spawn_nodes(self.num_nodes);

        let repo_root = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    elapsed_ms: started.elapsed().as_millis(),
                    nodes: Vec::new(),
                    transfers: Vec::new(),
                    failure_reason: Some(format!("creating repository root: {err}")),
                }
            }
        };

        let mut params = self.params.clone();
        let mut sidecar = false;
        for fault in std::iter::once(scenario.builtin_fault()).chain(self.faults.iter().copied()) {
            match fault {
                BuiltinFault::None => {}
                BuiltinFault::Partition(a, b) => match (world.node(a), world.node(b)) {
                    (Some(a), Some(b)) => {
                        info!("partitioning node {} from node {}", a.index, b.index);
                        world
                            .controller
                            .partition(vec![a.peer_id.clone()], vec![b.peer_id.clone()]);
                    }
                    _ => warn!("partition {}:{} names a missing node, ignored", a, b),
                },
                BuiltinFault::RejectTransfers(index) => match world.node(index) {
                    Some(node) => {
                        info!("node {} rejects transfers", index);
                        world.hub.reject_transfers(&node.peer_id);
                    }
                    None => warn!("node {} does not exist, rejection ignored", index),
                },
                BuiltinFault::Loss(a, b, rate) => match (world.node(a), world.node(b)) {
                    (Some(from), Some(to)) => {
                        info!("link {} -> {} loses {:.0}% of messages", from.index, to.index, rate * 100.0);
                        world.controller.set_loss(&from.peer_id, &to.peer_id, rate);
                    }
                    _ => warn!("loss {}:{} names a missing node, ignored", a, b),
                },
                BuiltinFault::Latency(ms) => {
                    sidecar = true;
                    params.insert("latency".to_string(), ms.to_string());
                }
            }
        }

        let count = world.node_count() as u64;
        let mut handles = Vec::with_capacity(world.node_count());
        for node in &world.nodes {
            let mut env = RunEnv::new(scenario.kind().name(), count);
            env.params = params.clone();
            if sidecar {
                env = env.with_sidecar(node.hostname.clone());
            }
            let shaper = sidecar.then(|| node.shaper());
            let run = run_scenario(env, world.sync_client(), shaper, node.parts(repo_root.path()))
                .instrument(info_span!("node", index = node.index));
            let mut handle = tokio::spawn(run);

            // Admit nodes one at a time so sequence numbers follow node indices
            let assign_seq = ASSIGN_SEQ;
            let admitted = tokio::select! {
                joined = &mut handle => Either::Left(ready(joined)),
                taken = world.sync.wait_count(&assign_seq, node.index + 1) => {
                    if let Err(err) = taken {
                        warn!("node {} admission: {}", node.index, err);
                    }
                    Either::Right(handle)
                }
            };
            handles.push(admitted);
        }

        let reports = join_all(handles).await;

        let mut nodes = Vec::with_capacity(reports.len());
        for (node, joined) in world.nodes.iter().zip(reports) {
            let (mut summary, report) = match joined {
                Ok(report) => (summarize(&report), Some(report)),
                Err(err) => (
                    NodeSummary {
                        index: node.index,
                        peername: String::new(),
                        seq: None,
                        role: None,
                        state: ScenarioState::Idle.to_string(),
                        peers: 0,
                        profiles: 0,
                        foreign_logs: 0,
                        failures: Vec::new(),
                        fatal: Some(PlanError::Task(err.to_string()).to_string()),
                    },
                    None,
                ),
            };
            summary.index = node.index;
            summary.peername = node.peername.clone();
            summary.profiles = node.transport.known_profiles().len();
            summary.foreign_logs = match node.datasets.list_logs().await {
                Ok(logs) => logs.iter().filter(|log| log.author != node.peername).count(),
                Err(_) => 0,
            };
            if let Some(report) = report {
                debug!("node {} report: {:?}", node.index, report.outcome);
            }
            nodes.push(summary);
        }

        let failure_reason = nodes
            .iter()
            .find(|n| !n.finished())
            .map(|n| match &n.fatal {
                Some(fatal) => format!("node {} aborted: {}", n.index, fatal),
                None => format!("node {} stopped in {}", n.index, n.state),
            });
        let passed = failure_reason.is_none();

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            elapsed_ms: started.elapsed().as_millis(),
            nodes,
            transfers: world.hub.transfers(),
            failure_reason,
        }
    }
}

fn summarize(report: &NodeReport) -> NodeSummary {
    let (failures, fatal) = match &report.outcome {
        Ok(()) => (Vec::new(), None),
        Err(PlanError::Partial(partial)) => (partial.failures().to_vec(), None),
        Err(PlanError::Aborted { cause, partial }) => (partial.failures().to_vec(), Some(cause.to_string())),
        Err(err) => (Vec::new(), Some(err.to_string())),
    };

    NodeSummary {
        index: 0,
        peername: String::new(),
        seq: report.seq,
        role: report.role_label().map(str::to_string),
        state: report.state.to_string(),
        peers: report.peer_count,
        profiles: 0,
        foreign_logs: 0,
        failures,
        fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TransferKind;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_push_scenario() {
        let result = ScenarioRunner::new(42, 4)
            .with_dataset_size(20)
            .run(ScenarioId::Push)
            .await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 0);
        assert_eq!(result.nodes_with_role("remote").count(), 2);
        assert_eq!(result.nodes_with_role("pusher").count(), 2);
        assert!(result.nodes.iter().all(|n| n.peers == 3));

        // Exactly one attempt per (pusher, remote) pair
        let pairs: HashSet<_> = result
            .transfers
            .iter()
            .map(|t| (t.initiator.clone(), t.remote.clone()))
            .collect();
        assert_eq!(result.transfers.len(), 4);
        assert_eq!(pairs.len(), 4);
        assert!(result.transfers.iter().all(|t| t.kind == TransferKind::Push && t.succeeded));

        for remote in result.nodes_with_role("remote") {
            assert_eq!(remote.foreign_logs, 2);
        }
    }

    #[tokio::test]
    async fn test_sequence_follows_node_index() {
        let result = ScenarioRunner::new(7, 4).run(ScenarioId::Push).await;

        for node in &result.nodes {
            assert_eq!(node.seq, Some(node.index));
        }
        assert_eq!(result.node_by_seq(0).unwrap().role.as_deref(), Some("remote"));
        assert_eq!(result.node_by_seq(1).unwrap().role.as_deref(), Some("pusher"));
    }

    #[tokio::test]
    async fn test_partitioned_push_records_one_failure() {
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::PartitionedPush).await;

        // Every node still finishes
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 1);

        let pusher = result.node_by_seq(1).unwrap();
        assert_eq!(pusher.failures.len(), 1);
        assert!(pusher.failures[0].starts_with("error pushing"));
        assert_eq!(result.transfers.iter().filter(|t| !t.succeeded).count(), 1);

        let remote = result.node_by_seq(0).unwrap();
        assert_eq!(remote.foreign_logs, 1);
    }

    #[tokio::test]
    async fn test_lossy_link_records_transfer_failure() {
        let result = ScenarioRunner::new(42, 4)
            .with_loss(3, 2, 1.0)
            .run(ScenarioId::Push)
            .await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 1);

        let pusher = result.node_by_seq(3).unwrap();
        assert_eq!(pusher.failures.len(), 1);
        assert!(pusher.failures[0].starts_with("error pushing"));
        assert!(pusher.failures[0].contains("dropped"));
        assert_eq!(result.node_by_seq(2).unwrap().foreign_logs, 1);
    }

    #[tokio::test]
    async fn test_pull_scenario() {
        let result = ScenarioRunner::new(42, 4)
            .with_dataset_size(20)
            .run(ScenarioId::Pull)
            .await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 0);
        assert_eq!(result.transfers.len(), 4);
        assert!(result.transfers.iter().all(|t| t.kind == TransferKind::Pull));
        for puller in result.nodes_with_role("puller") {
            assert_eq!(puller.foreign_logs, 2);
        }
    }

    #[tokio::test]
    async fn test_rejecting_remote() {
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::RejectingRemote).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        for puller in result.nodes_with_role("puller") {
            assert_eq!(puller.failures.len(), 1);
            assert!(puller.failures[0].contains("rejected"));
            assert_eq!(puller.foreign_logs, 1);
        }
    }

    #[tokio::test]
    async fn test_profile_exchange_single_connector() {
        let result = ScenarioRunner::new(42, 3)
            .with_ratio(2)
            .run(ScenarioId::ProfileExchange)
            .await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 0);

        let connector = result.node_by_seq(0).unwrap();
        assert_eq!(connector.role.as_deref(), Some("connector"));
        assert_eq!(connector.profiles, 2);
        for listener in result.nodes_with_role("listener") {
            assert_eq!(listener.profiles, 1);
        }
    }

    #[tokio::test]
    async fn test_profile_exchange_duplicate_connections() {
        // Two connectors dial each other: both see each other twice
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::ProfileExchange).await;

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.failure_count(), 0);
        for connector in result.nodes_with_role("connector") {
            assert_eq!(connector.profiles, 3);
        }
        for listener in result.nodes_with_role("listener") {
            assert_eq!(listener.profiles, 2);
        }
    }

    #[tokio::test]
    async fn test_slow_links() {
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::SlowLinks).await;
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[tokio::test]
    async fn test_invalid_ratio_fails_every_node() {
        let result = ScenarioRunner::new(42, 3)
            .with_ratio(3)
            .run(ScenarioId::Push)
            .await;

        assert!(!result.passed);
        assert!(result.nodes.iter().all(|n| n.seq.is_none() && n.fatal.is_some()));
    }

    #[tokio::test]
    async fn test_same_seed_same_outcome() {
        let a = ScenarioRunner::new(11, 4).run(ScenarioId::PartitionedPush).await;
        let b = ScenarioRunner::new(11, 4).run(ScenarioId::PartitionedPush).await;

        let names = |r: &ScenarioResult| r.nodes.iter().map(|n| (n.peername.clone(), n.role.clone())).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.failure_count(), b.failure_count());
    }
}
