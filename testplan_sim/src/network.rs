//! Simulated peer transport with fault injection.
//!
//! All transports of a run join one [`SimSwarm`]. Dials and streams are
//! checked against the [`SimNetworkController`], which holds partitions,
//! per-link latency and loss. Opening the profile protocol stream performs
//! a profile exchange: both ends record each other's profile and emit
//! `ProfileConnected`.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use testplan_core::scenarios::PROFILE_PROTOCOL;
use testplan_env::{
    ConnectionEvent, EnvError, NetworkConfig, NetworkShaper, PeerEndpoint, PeerId, PeerTransport, ProfileId,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Per-link latency
    link_latency: Mutex<HashMap<(PeerId, PeerId), Duration>>,

    /// Latency applied to every outgoing link of a node
    node_latency: Mutex<HashMap<PeerId, Duration>>,

    /// Per-link packet loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(PeerId, PeerId), f64>>,

    /// Active partitions (groups that cannot communicate)
    partitions: Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>,

    /// Nodes cut off from the network entirely
    disabled: Mutex<HashSet<PeerId>>,

    /// Entropy for loss decisions
    rng: Mutex<ChaCha8Rng>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new(seed: u64) -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            node_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
            disabled: Mutex::new(HashSet::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Sets latency for a specific link.
    pub fn set_latency(&self, from: &PeerId, to: &PeerId, latency: Duration) {
        lock(&self.link_latency).insert((from.clone(), to.clone()), latency);
    }

    /// Sets the latency of every outgoing link of `node`.
    pub fn set_node_latency(&self, node: &PeerId, latency: Duration) {
        lock(&self.node_latency).insert(node.clone(), latency);
    }

    /// Sets packet loss rate for a link.
    pub fn set_loss(&self, from: &PeerId, to: &PeerId, loss_rate: f64) {
        lock(&self.link_loss).insert((from.clone(), to.clone()), loss_rate.clamp(0.0, 1.0));
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<PeerId>, group_b: Vec<PeerId>) {
        lock(&self.partitions).push((group_a, group_b));
    }

    /// Connects or disconnects a node from the network.
    pub fn set_enabled(&self, node: &PeerId, enabled: bool) {
        let mut disabled = lock(&self.disabled);
        if enabled {
            disabled.remove(node);
        } else {
            disabled.insert(node.clone());
        }
    }

    /// Heals all active partitions.
    pub fn heal_all(&self) {
        lock(&self.partitions).clear();
        lock(&self.disabled).clear();
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: &PeerId, to: &PeerId) -> bool {
        {
            let disabled = lock(&self.disabled);
            if disabled.contains(from) || disabled.contains(to) {
                return false;
            }
        }

        let partitions = lock(&self.partitions);
        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(from);
            let from_in_b = group_b.contains(from);
            let to_in_a = group_a.contains(to);
            let to_in_b = group_b.contains(to);

            // Partitioned if one is in A and other in B (or vice versa)
            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    /// Gets the latency for a link: link-specific, else the sender's default.
    pub fn get_latency(&self, from: &PeerId, to: &PeerId) -> Duration {
        if let Some(latency) = lock(&self.link_latency).get(&(from.clone(), to.clone())) {
            return *latency;
        }
        lock(&self.node_latency).get(from).copied().unwrap_or(Duration::ZERO)
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, from: &PeerId, to: &PeerId) -> f64 {
        *lock(&self.link_loss).get(&(from.clone(), to.clone())).unwrap_or(&0.0)
    }

    /// Rolls for loss on a link.
    pub fn should_drop(&self, from: &PeerId, to: &PeerId) -> bool {
        let loss = self.get_loss(from, to);
        loss > 0.0 && lock(&self.rng).gen_bool(loss)
    }
}

struct NodeEntry {
    peername: String,
    profile_id: ProfileId,
    endpoint: PeerEndpoint,
    events: broadcast::Sender<ConnectionEvent>,
    connected: HashSet<PeerId>,
    profiles: BTreeMap<ProfileId, String>,
}

#[derive(Default)]
struct SwarmState {
    nodes: HashMap<PeerId, NodeEntry>,
    addrs: HashMap<String, PeerId>,
}

/// Shared registry of every simulated transport in a run.
#[derive(Clone)]
pub struct SimSwarm {
    state: Arc<Mutex<SwarmState>>,
    controller: Arc<SimNetworkController>,
}

impl SimSwarm {
    pub fn new(controller: Arc<SimNetworkController>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SwarmState::default())),
            controller,
        }
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    /// Registers a node and returns its transport.
    pub fn join(&self, key: &SigningKey, index: u64, peername: &str, profile_id: ProfileId) -> Arc<SimTransport> {
        let id = PeerId::from_public_key(&key.verifying_key());
        let addr = format!("/sim/{index}/p2p/{}", id.as_str());
        let endpoint = PeerEndpoint::new(id.clone(), vec![addr.clone()]);
        let (events, _) = broadcast::channel(256);

        let mut state = lock(&self.state);
        state.addrs.insert(addr, id.clone());
        state.nodes.insert(
            id.clone(),
            NodeEntry {
                peername: peername.to_string(),
                profile_id,
                endpoint: endpoint.clone(),
                events: events.clone(),
                connected: HashSet::new(),
                profiles: BTreeMap::new(),
            },
        );

        Arc::new(SimTransport {
            endpoint,
            swarm: self.clone(),
            events,
            book: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up the node listening on `addr`.
    pub fn resolve(&self, addr: &str) -> Option<PeerId> {
        lock(&self.state).addrs.get(addr).cloned()
    }

    /// Applies link conditions to one message from `from` to `to`.
    pub async fn traverse(&self, from: &PeerId, to: &PeerId) -> Result<(), EnvError> {
        if !lock(&self.state).nodes.contains_key(to) {
            return Err(EnvError::unreachable(to));
        }
        if !self.controller.can_communicate(from, to) {
            debug!("link {} -> {} partitioned", from, to);
            return Err(EnvError::unreachable(to));
        }
        let latency = self.controller.get_latency(from, to);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.controller.should_drop(from, to) {
            return Err(EnvError::network(format!("message {from} -> {to} dropped")));
        }
        Ok(())
    }

    /// Marks two nodes connected; emits `PeerConnected` on first contact.
    fn connect_pair(&self, a: &PeerId, b: &PeerId) {
        let mut state = lock(&self.state);
        let endpoints = (
            state.nodes.get(a).map(|n| n.endpoint.clone()),
            state.nodes.get(b).map(|n| n.endpoint.clone()),
        );
        let (Some(a_endpoint), Some(b_endpoint)) = endpoints else {
            return;
        };
        if let Some(node) = state.nodes.get_mut(a) {
            if node.connected.insert(b.clone()) {
                let _ = node.events.send(ConnectionEvent::PeerConnected(b_endpoint));
            }
        }
        if let Some(node) = state.nodes.get_mut(b) {
            if node.connected.insert(a.clone()) {
                let _ = node.events.send(ConnectionEvent::PeerConnected(a_endpoint));
            }
        }
    }

    fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        lock(&self.state)
            .nodes
            .get(a)
            .is_some_and(|node| node.connected.contains(b))
    }

    /// Records a profile exchange on both ends and notifies them.
    fn exchange_profiles(&self, a: &PeerId, b: &PeerId) {
        let mut state = lock(&self.state);
        let profiles = (
            state.nodes.get(a).map(|n| (n.profile_id, n.peername.clone())),
            state.nodes.get(b).map(|n| (n.profile_id, n.peername.clone())),
        );
        let (Some((a_profile, a_name)), Some((b_profile, b_name))) = profiles else {
            return;
        };
        if let Some(node) = state.nodes.get_mut(a) {
            node.profiles.insert(b_profile, b_name.clone());
            let _ = node.events.send(ConnectionEvent::ProfileConnected {
                profile_id: b_profile,
                peername: b_name,
            });
        }
        if let Some(node) = state.nodes.get_mut(b) {
            node.profiles.insert(a_profile, a_name.clone());
            let _ = node.events.send(ConnectionEvent::ProfileConnected {
                profile_id: a_profile,
                peername: a_name,
            });
        }
    }

    fn known_profiles(&self, node: &PeerId) -> Vec<(ProfileId, String)> {
        lock(&self.state)
            .nodes
            .get(node)
            .map(|n| n.profiles.iter().map(|(id, name)| (*id, name.clone())).collect())
            .unwrap_or_default()
    }
}

/// One node's view of the swarm.
pub struct SimTransport {
    endpoint: PeerEndpoint,
    swarm: SimSwarm,
    events: broadcast::Sender<ConnectionEvent>,
    book: Mutex<HashMap<PeerId, Vec<String>>>,
}

impl SimTransport {
    pub fn id(&self) -> &PeerId {
        &self.endpoint.id
    }
}

#[async_trait]
impl PeerTransport for SimTransport {
    fn local_endpoint(&self) -> PeerEndpoint {
        self.endpoint.clone()
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[String]) {
        let mut book = lock(&self.book);
        let known = book.entry(peer.clone()).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    fn addrs(&self, peer: &PeerId) -> Vec<String> {
        lock(&self.book).get(peer).cloned().unwrap_or_default()
    }

    async fn connect(&self, endpoint: &PeerEndpoint) -> Result<(), EnvError> {
        if endpoint.id == self.endpoint.id {
            return Err(EnvError::network("cannot dial self"));
        }
        let reachable = endpoint
            .addrs
            .iter()
            .chain(self.addrs(&endpoint.id).iter())
            .any(|addr| self.swarm.resolve(addr).as_ref() == Some(&endpoint.id));
        if !reachable {
            return Err(EnvError::unreachable(format!("{} (no dialable address)", endpoint.id)));
        }

        self.swarm.traverse(&self.endpoint.id, &endpoint.id).await?;
        self.swarm.connect_pair(&self.endpoint.id, &endpoint.id);
        debug!("{} dialed {}", self.endpoint.id, endpoint.id);
        Ok(())
    }

    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<(), EnvError> {
        if !self.swarm.is_connected(&self.endpoint.id, peer) {
            return Err(EnvError::network(format!("not connected to {peer}")));
        }
        self.swarm.traverse(&self.endpoint.id, peer).await?;

        if protocol == PROFILE_PROTOCOL {
            self.swarm.exchange_profiles(&self.endpoint.id, peer);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn known_profiles(&self) -> Vec<(ProfileId, String)> {
        self.swarm.known_profiles(&self.endpoint.id)
    }
}

/// Applies link shapes through the swarm's controller.
pub struct SimShaper {
    node: PeerId,
    controller: Arc<SimNetworkController>,
}

impl SimShaper {
    pub fn new(node: PeerId, controller: Arc<SimNetworkController>) -> Self {
        Self { node, controller }
    }
}

#[async_trait]
impl NetworkShaper for SimShaper {
    async fn apply(&self, config: &NetworkConfig) -> Result<(), EnvError> {
        self.controller.set_enabled(&self.node, config.enable);
        self.controller.set_node_latency(&self.node, config.default.latency);
        info!(
            "shaped {} on {:?}: latency {:?}, bandwidth {} B/s",
            self.node, config.network, config.default.latency, config.default.bandwidth
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DeterministicKeyProvider;
    use proptest::prelude::*;

    fn swarm_of(n: u64) -> (SimSwarm, Vec<Arc<SimTransport>>) {
        let swarm = SimSwarm::new(Arc::new(SimNetworkController::new(7)));
        let mut keys = DeterministicKeyProvider::new(42);
        let transports = (0..n)
            .map(|i| swarm.join(&keys.node_key(i), i, &keys.peername(i), keys.profile_id(i)))
            .collect();
        (swarm, transports)
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new(1);

        let a = PeerId::from_string("a");
        let b = PeerId::from_string("b");
        let c = PeerId::from_string("c");

        // Initially all can communicate
        assert!(controller.can_communicate(&a, &b));
        assert!(controller.can_communicate(&a, &c));
        assert!(controller.can_communicate(&b, &c));

        // Partition: {a} vs {b, c}
        controller.partition(vec![a.clone()], vec![b.clone(), c.clone()]);

        assert!(!controller.can_communicate(&a, &b));
        assert!(!controller.can_communicate(&a, &c));
        assert!(controller.can_communicate(&b, &c));

        controller.heal_all();
        assert!(controller.can_communicate(&a, &b));
    }

    #[test]
    fn test_network_controller_latency() {
        let controller = SimNetworkController::new(1);
        let a = PeerId::from_string("a");
        let b = PeerId::from_string("b");

        assert_eq!(controller.get_latency(&a, &b), Duration::ZERO);

        controller.set_node_latency(&a, Duration::from_millis(20));
        assert_eq!(controller.get_latency(&a, &b), Duration::from_millis(20));

        controller.set_latency(&a, &b, Duration::from_millis(100));
        assert_eq!(controller.get_latency(&a, &b), Duration::from_millis(100));

        // Reverse direction is separate
        assert_eq!(controller.get_latency(&b, &a), Duration::ZERO);
    }

    #[test]
    fn test_network_controller_loss() {
        let controller = SimNetworkController::new(1);
        let a = PeerId::from_string("a");
        let b = PeerId::from_string("b");

        assert!(!controller.should_drop(&a, &b));

        controller.set_loss(&a, &b, 2.0);
        assert_eq!(controller.get_loss(&a, &b), 1.0);
        assert!(controller.should_drop(&a, &b));
        assert!(!controller.should_drop(&b, &a));

        controller.set_loss(&a, &b, 0.5);
        let drops = (0..200).filter(|_| controller.should_drop(&a, &b)).count();
        assert!(drops > 50 && drops < 150, "{drops}");
    }

    #[test]
    fn test_loss_rolls_are_seeded() {
        let rolls = |seed| {
            let controller = SimNetworkController::new(seed);
            let (a, b) = (PeerId::from_string("a"), PeerId::from_string("b"));
            controller.set_loss(&a, &b, 0.5);
            (0..32).map(|_| controller.should_drop(&a, &b)).collect::<Vec<_>>()
        };
        assert_eq!(rolls(9), rolls(9));
    }

    proptest! {
        #[test]
        fn prop_partition_is_symmetric(split in 1usize..5, probe_a in 0usize..6, probe_b in 0usize..6) {
            let controller = SimNetworkController::new(3);
            let ids: Vec<_> = (0..6).map(|i| PeerId::from_string(format!("n{i}"))).collect();
            controller.partition(ids[..split].to_vec(), ids[split..].to_vec());

            let (a, b) = (&ids[probe_a], &ids[probe_b]);
            prop_assert_eq!(controller.can_communicate(a, b), controller.can_communicate(b, a));
            prop_assert_eq!(controller.can_communicate(a, b), (probe_a < split) == (probe_b < split));
        }
    }

    #[tokio::test]
    async fn test_connect_emits_events_once() {
        let (_swarm, nodes) = swarm_of(2);
        let mut events = nodes[1].events();

        nodes[0].connect(&nodes[1].local_endpoint()).await.unwrap();
        nodes[0].connect(&nodes[1].local_endpoint()).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, ConnectionEvent::PeerConnected(nodes[0].local_endpoint()));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_profile_stream_exchanges_profiles() {
        let (_swarm, nodes) = swarm_of(2);

        assert!(nodes[0].open_stream(nodes[1].id(), PROFILE_PROTOCOL).await.is_err());

        nodes[0].connect(&nodes[1].local_endpoint()).await.unwrap();
        nodes[0].open_stream(nodes[1].id(), PROFILE_PROTOCOL).await.unwrap();

        assert_eq!(nodes[0].known_profiles().len(), 1);
        assert_eq!(nodes[1].known_profiles().len(), 1);
    }

    #[tokio::test]
    async fn test_partitioned_dial_fails() {
        let (swarm, nodes) = swarm_of(2);
        swarm
            .controller()
            .partition(vec![nodes[0].id().clone()], vec![nodes[1].id().clone()]);

        let err = nodes[0].connect(&nodes[1].local_endpoint()).await.unwrap_err();
        assert!(matches!(err, EnvError::PeerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_shaper_disables_node() {
        let (swarm, nodes) = swarm_of(2);
        let shaper = SimShaper::new(nodes[0].id().clone(), Arc::clone(swarm.controller()));
        let mut config = NetworkConfig {
            network: "default".to_string(),
            enable: false,
            default: Default::default(),
            callback_state: testplan_env::StateName::from_static("network-configured"),
        };

        shaper.apply(&config).await.unwrap();
        assert!(nodes[0].connect(&nodes[1].local_endpoint()).await.is_err());

        config.enable = true;
        shaper.apply(&config).await.unwrap();
        nodes[0].connect(&nodes[1].local_endpoint()).await.unwrap();
    }
}
