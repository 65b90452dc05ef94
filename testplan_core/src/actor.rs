//! The per-node actor: transport, dataset engine, repository directory and
//! the connection event dispatcher.

use crate::config::RunContext;
use crate::dataset::generate_csv;
use crate::error::PlanError;
use crate::events::EventTable;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testplan_env::{ActorInfo, DatasetEngine, DatasetRef, PeerTransport, ProfileId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything an actor is built from, handed to the plan at join time.
#[derive(Clone)]
pub struct ActorParts {
    pub peername: String,
    pub profile_id: ProfileId,
    pub transport: Arc<dyn PeerTransport>,
    pub datasets: Arc<dyn DatasetEngine>,

    /// Directory owned by this actor for dataset bodies
    pub repo_dir: PathBuf,
}

/// A constructed actor.
///
/// Dropping the actor stops its event dispatcher.
pub struct Actor {
    peername: String,
    profile_id: ProfileId,
    transport: Arc<dyn PeerTransport>,
    datasets: Arc<dyn DatasetEngine>,
    repo_dir: PathBuf,
    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
    profile_events: Option<mpsc::UnboundedReceiver<ProfileId>>,
    versions: Vec<DatasetRef>,
}

impl Actor {
    /// Starts an actor, dispatching transport events through `table`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(parts: ActorParts, table: EventTable) -> Self {
        let cancel = CancellationToken::new();
        let dispatcher = table.spawn_dispatcher(parts.transport.events(), cancel.clone());
        info!("actor {} started ({})", parts.peername, parts.transport.local_endpoint().id);

        Self {
            peername: parts.peername,
            profile_id: parts.profile_id,
            transport: parts.transport,
            datasets: parts.datasets,
            repo_dir: parts.repo_dir,
            cancel,
            dispatcher: Some(dispatcher),
            profile_events: None,
            versions: Vec::new(),
        }
    }

    /// Attaches the receiving end of a profile forwarding handler.
    pub fn with_profile_events(mut self, rx: mpsc::UnboundedReceiver<ProfileId>) -> Self {
        self.profile_events = Some(rx);
        self
    }

    pub fn take_profile_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProfileId>> {
        self.profile_events.take()
    }

    pub fn peername(&self) -> &str {
        &self.peername
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn datasets(&self) -> &Arc<dyn DatasetEngine> {
        &self.datasets
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// The identity this actor publishes during info exchange.
    pub fn info(&self, seq: u64) -> ActorInfo {
        ActorInfo {
            seq,
            peername: self.peername.clone(),
            profile_id: self.profile_id,
            endpoint: self.transport.local_endpoint(),
        }
    }

    /// Writes a generated CSV body of `rows` records and saves it as a new
    /// version of `name`.
    pub async fn generate_dataset_version(
        &mut self,
        name: &str,
        rows: usize,
        seed: u64,
    ) -> Result<DatasetRef, PlanError> {
        let body = generate_csv(&mut StdRng::seed_from_u64(seed), rows);

        tokio::fs::create_dir_all(&self.repo_dir).await?;
        let path = self.repo_dir.join(format!("{name}.csv"));
        tokio::fs::write(&path, body).await?;

        let reference = self.datasets.save_version(name, &path).await?;
        info!("{} saved {} ({} rows)", self.peername, reference, rows);
        self.versions.push(reference.clone());
        Ok(reference)
    }

    /// Most recently saved version.
    pub fn latest_version(&self) -> Option<&DatasetRef> {
        self.versions.last()
    }

    /// Stops the event dispatcher and waits for it to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(err) = handle.await {
                debug!("event dispatcher ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builds the scenario's actor from its parts.
///
/// An error is not raised immediately: the plan first enters the
/// construction barrier so peers are not left waiting.
#[async_trait]
pub trait ActorConstructor: Send + Sync {
    async fn construct(&self, ctx: &RunContext, parts: ActorParts) -> Result<Actor, PlanError>;
}
