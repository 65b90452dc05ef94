//! In-memory collaborators for unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use testplan_env::{
    ConnectionEvent, DatasetEngine, DatasetLog, DatasetRef, EnvError, PeerEndpoint, PeerId, PeerTransport,
    ProfileId, RemoteHooks,
};
use tokio::sync::broadcast;

pub struct FakeTransport {
    endpoint: PeerEndpoint,
    book: Mutex<HashMap<PeerId, Vec<String>>>,
    events: broadcast::Sender<ConnectionEvent>,
    pub connects: Mutex<Vec<PeerId>>,
}

impl FakeTransport {
    pub fn new(seq: u64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            endpoint: PeerEndpoint::new(
                PeerId::from_string(format!("{seq:0>8}fake")),
                vec![format!("/memory/{seq}")],
            ),
            book: Mutex::new(HashMap::new()),
            events,
            connects: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn local_endpoint(&self) -> PeerEndpoint {
        self.endpoint.clone()
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[String]) {
        self.book.lock().unwrap().insert(peer.clone(), addrs.to_vec());
    }

    fn addrs(&self, peer: &PeerId) -> Vec<String> {
        self.book.lock().unwrap().get(peer).cloned().unwrap_or_default()
    }

    async fn connect(&self, endpoint: &PeerEndpoint) -> Result<(), EnvError> {
        self.connects.lock().unwrap().push(endpoint.id.clone());
        Ok(())
    }

    async fn open_stream(&self, _peer: &PeerId, _protocol: &str) -> Result<(), EnvError> {
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn known_profiles(&self) -> Vec<(ProfileId, String)> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct FakeDatasets {
    pub peername: String,
    pub saved: Mutex<Vec<(String, String)>>,
}

impl FakeDatasets {
    pub fn new(peername: &str) -> Arc<Self> {
        Arc::new(Self {
            peername: peername.to_string(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl DatasetEngine for FakeDatasets {
    async fn save_version(&self, name: &str, body_path: &Path) -> Result<DatasetRef, EnvError> {
        let body = tokio::fs::read_to_string(body_path)
            .await
            .map_err(|e| EnvError::dataset(e.to_string()))?;
        self.saved.lock().unwrap().push((name.to_string(), body));
        let mut reference = DatasetRef::named(&self.peername, name);
        reference.path = format!("/fake/{}", self.saved.lock().unwrap().len());
        Ok(reference)
    }

    async fn push_to_remote(&self, _reference: &DatasetRef, _remote_name: &str) -> Result<(), EnvError> {
        Ok(())
    }

    async fn pull_from_remote(&self, _reference: &DatasetRef, _remote_addr: &str) -> Result<(), EnvError> {
        Ok(())
    }

    async fn list_logs(&self) -> Result<Vec<DatasetLog>, EnvError> {
        Ok(Vec::new())
    }

    fn set_remote(&self, _name: &str, _peer: &PeerId) {}

    fn enable_remote(&self, _hooks: Arc<dyn RemoteHooks>) {}
}
