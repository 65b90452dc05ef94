//! In-memory dataset engines with remotes.
//!
//! Each node gets a [`SimDatasetEngine`]; all engines of a run register
//! with one [`SimRemoteHub`], which delivers pushes and serves pulls
//! between them over the simulated swarm and keeps a record of every
//! transfer attempt.

use crate::network::SimSwarm;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use testplan_env::{DatasetEngine, DatasetLog, DatasetRef, EnvError, PeerId, ProfileId, RemoteHooks};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Push,
    Pull,
}

/// One attempted transfer between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub kind: TransferKind,

    /// Node that initiated the transfer
    pub initiator: PeerId,

    /// Remote it targeted
    pub remote: PeerId,

    pub dataset: String,
    pub succeeded: bool,
}

#[derive(Default)]
struct EngineState {
    /// Logs keyed by `(author, name)`
    logs: BTreeMap<(String, String), DatasetLog>,
    remotes: BTreeMap<String, PeerId>,
    hooks: Option<Arc<dyn RemoteHooks>>,
}

impl EngineState {
    fn merge(&mut self, log: DatasetLog) {
        let entry = self
            .logs
            .entry((log.author.clone(), log.name.clone()))
            .or_insert_with(|| DatasetLog {
                name: log.name.clone(),
                author: log.author.clone(),
                versions: Vec::new(),
            });
        for version in log.versions {
            if !entry.versions.contains(&version) {
                entry.versions.push(version);
            }
        }
    }

    fn find(&self, reference: &DatasetRef) -> Option<&DatasetLog> {
        self.logs.get(&(reference.peername.clone(), reference.name.clone()))
    }
}

#[derive(Default)]
struct HubState {
    engines: HashMap<PeerId, Arc<Mutex<EngineState>>>,
    rejecting: HashSet<PeerId>,
    transfers: Vec<TransferRecord>,
}

/// Routes transfers between the dataset engines of one run.
#[derive(Clone, Default)]
pub struct SimRemoteHub {
    state: Arc<Mutex<HubState>>,
}

impl SimRemoteHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `remote` refuse every push and pull it is asked to serve.
    pub fn reject_transfers(&self, remote: &PeerId) {
        lock(&self.state).rejecting.insert(remote.clone());
    }

    /// Every transfer attempted so far, in attempt order.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        lock(&self.state).transfers.clone()
    }

    fn register(&self, peer: &PeerId, engine: Arc<Mutex<EngineState>>) {
        lock(&self.state).engines.insert(peer.clone(), engine);
    }

    fn record(&self, kind: TransferKind, initiator: &PeerId, remote: &PeerId, dataset: &DatasetRef, succeeded: bool) {
        lock(&self.state).transfers.push(TransferRecord {
            kind,
            initiator: initiator.clone(),
            remote: remote.clone(),
            dataset: dataset.alias(),
            succeeded,
        });
    }

    /// Looks up a serving remote's state and hooks.
    fn serving(&self, remote: &PeerId) -> Result<(Arc<Mutex<EngineState>>, Arc<dyn RemoteHooks>), EnvError> {
        let hub = lock(&self.state);
        if hub.rejecting.contains(remote) {
            return Err(EnvError::dataset(format!("remote {remote} rejected the transfer")));
        }
        let engine = hub
            .engines
            .get(remote)
            .cloned()
            .ok_or_else(|| EnvError::unreachable(remote))?;
        let hooks = lock(&engine)
            .hooks
            .clone()
            .ok_or_else(|| EnvError::dataset(format!("{remote} is not accepting remote requests")))?;
        Ok((engine, hooks))
    }

    fn deliver_push(&self, remote: &PeerId, from: &ProfileId, reference: &DatasetRef, log: DatasetLog) -> Result<(), EnvError> {
        let (engine, hooks) = self.serving(remote)?;
        hooks.push_pre_check(from, reference)?;
        lock(&engine).merge(log);
        hooks.dataset_pushed(from, reference);
        Ok(())
    }

    fn serve_pull(&self, remote: &PeerId, by: &ProfileId, reference: &DatasetRef) -> Result<DatasetLog, EnvError> {
        let (engine, hooks) = self.serving(remote)?;
        let log = lock(&engine)
            .find(reference)
            .cloned()
            .ok_or_else(|| EnvError::dataset(format!("{} not found on {remote}", reference.alias())))?;
        hooks.dataset_pulled(by, reference);
        Ok(log)
    }
}

/// One node's dataset repository.
pub struct SimDatasetEngine {
    owner: PeerId,
    peername: String,
    profile_id: ProfileId,
    state: Arc<Mutex<EngineState>>,
    hub: SimRemoteHub,
    swarm: SimSwarm,
}

impl SimDatasetEngine {
    /// Creates an engine and registers it with `hub`.
    pub fn new(owner: PeerId, peername: &str, profile_id: ProfileId, hub: SimRemoteHub, swarm: SimSwarm) -> Arc<Self> {
        let state = Arc::new(Mutex::new(EngineState::default()));
        hub.register(&owner, Arc::clone(&state));
        Arc::new(Self {
            owner,
            peername: peername.to_string(),
            profile_id,
            state,
            hub,
            swarm,
        })
    }
}

#[async_trait]
impl DatasetEngine for SimDatasetEngine {
    async fn save_version(&self, name: &str, body_path: &Path) -> Result<DatasetRef, EnvError> {
        let body = tokio::fs::read(body_path)
            .await
            .map_err(|err| EnvError::dataset(format!("reading {}: {err}", body_path.display())))?;
        if body.is_empty() {
            return Err(EnvError::dataset(format!("{} has an empty body", body_path.display())));
        }

        let mut state = lock(&self.state);
        let key = (self.peername.clone(), name.to_string());
        let log = state.logs.entry(key).or_insert_with(|| DatasetLog {
            name: name.to_string(),
            author: self.peername.clone(),
            versions: Vec::new(),
        });
        let path = format!("/mem/{}/{}/{}", self.peername, name, log.versions.len());
        log.versions.push(path.clone());
        debug!("saved {}/{} ({} bytes) at {}", self.peername, name, body.len(), path);

        Ok(DatasetRef {
            peername: self.peername.clone(),
            name: name.to_string(),
            path,
        })
    }

    async fn push_to_remote(&self, reference: &DatasetRef, remote_name: &str) -> Result<(), EnvError> {
        let (remote, log) = {
            let state = lock(&self.state);
            let remote = state
                .remotes
                .get(remote_name)
                .cloned()
                .ok_or_else(|| EnvError::dataset(format!("unknown remote {remote_name:?}")))?;
            let log = state
                .find(reference)
                .cloned()
                .ok_or_else(|| EnvError::dataset(format!("{} not found locally", reference.alias())))?;
            (remote, log)
        };

        let result = match self.swarm.traverse(&self.owner, &remote).await {
            Ok(()) => self.hub.deliver_push(&remote, &self.profile_id, reference, log),
            Err(err) => Err(err),
        };
        self.hub
            .record(TransferKind::Push, &self.owner, &remote, reference, result.is_ok());
        result
    }

    async fn pull_from_remote(&self, reference: &DatasetRef, remote_addr: &str) -> Result<(), EnvError> {
        let remote = self
            .swarm
            .resolve(remote_addr)
            .ok_or_else(|| EnvError::unreachable(remote_addr))?;

        let result = match self.swarm.traverse(&self.owner, &remote).await {
            Ok(()) => self.hub.serve_pull(&remote, &self.profile_id, reference),
            Err(err) => Err(err),
        };
        self.hub
            .record(TransferKind::Pull, &self.owner, &remote, reference, result.is_ok());

        lock(&self.state).merge(result?);
        Ok(())
    }

    async fn list_logs(&self) -> Result<Vec<DatasetLog>, EnvError> {
        Ok(lock(&self.state).logs.values().cloned().collect())
    }

    fn set_remote(&self, name: &str, peer: &PeerId) {
        lock(&self.state).remotes.insert(name.to_string(), peer.clone());
    }

    fn enable_remote(&self, hooks: Arc<dyn RemoteHooks>) {
        lock(&self.state).hooks = Some(hooks);
    }
}
