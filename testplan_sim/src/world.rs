//! SimWorld - every collaborator a run of N nodes shares.

use crate::dataset::{SimDatasetEngine, SimRemoteHub};
use crate::keys::DeterministicKeyProvider;
use crate::network::{SimNetworkController, SimShaper, SimSwarm, SimTransport};
use std::path::Path;
use std::sync::Arc;
use testplan_core::ActorParts;
use testplan_env::{LocalSyncService, NetworkShaper, PeerId, PeerTransport, ProfileId, SyncService};

/// Handle to one simulated node.
pub struct NodeHandle {
    pub index: u64,
    pub peer_id: PeerId,
    pub peername: String,
    pub profile_id: ProfileId,
    pub transport: Arc<SimTransport>,
    pub datasets: Arc<SimDatasetEngine>,
    pub shaper: Arc<SimShaper>,
    pub hostname: String,
}

impl NodeHandle {
    /// Parts handed to the node's plan; the repository lives under `repo_root`.
    pub fn parts(&self, repo_root: &Path) -> ActorParts {
        ActorParts {
            peername: self.peername.clone(),
            profile_id: self.profile_id,
            transport: self.transport.clone(),
            datasets: self.datasets.clone(),
            repo_dir: repo_root.join(&self.peername),
        }
    }

    pub fn shaper(&self) -> Arc<dyn NetworkShaper> {
        self.shaper.clone()
    }
}

/// The SimWorld - container for one run.
pub struct SimWorld {
    /// Key provider (deterministic identities)
    pub keys: DeterministicKeyProvider,

    /// Network controller for fault injection
    pub controller: Arc<SimNetworkController>,

    pub swarm: SimSwarm,
    pub hub: SimRemoteHub,
    pub sync: LocalSyncService,

    /// Spawned nodes, by index
    pub nodes: Vec<NodeHandle>,
}

impl SimWorld {
    /// Creates an empty world.
    pub fn new(seed: u64) -> Self {
        // Derive separate seeds for different subsystems
        let key_seed = seed.wrapping_mul(0x517cc1b727220a95);
        let network_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);

        let controller = Arc::new(SimNetworkController::new(network_seed));
        let swarm = SimSwarm::new(Arc::clone(&controller));

        Self {
            keys: DeterministicKeyProvider::new(key_seed),
            controller,
            swarm,
            hub: SimRemoteHub::new(),
            sync: LocalSyncService::new(),
            nodes: Vec::new(),
        }
    }

    /// Spawns `count` nodes.
    pub fn spawn_nodes(&mut self, count: usize) {
        for index in 0..count as u64 {
            let key = self.keys.node_key(index);
            let peername = self.keys.peername(index);
            let profile_id = self.keys.profile_id(index);

            let transport = self.swarm.join(&key, index, &peername, profile_id);
            let peer_id = transport.local_endpoint().id;
            let datasets = SimDatasetEngine::new(
                peer_id.clone(),
                &peername,
                profile_id,
                self.hub.clone(),
                self.swarm.clone(),
            );
            let shaper = Arc::new(SimShaper::new(peer_id.clone(), Arc::clone(&self.controller)));

            self.nodes.push(NodeHandle {
                index,
                peer_id,
                peername,
                profile_id,
                transport,
                datasets,
                shaper,
                hostname: format!("node-{index}"),
            });
        }
    }

    /// A fresh sync client for one node.
    pub fn sync_client(&self) -> Arc<dyn SyncService> {
        Arc::new(self.sync.client())
    }

    pub fn node(&self, index: usize) -> Option<&NodeHandle> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
