//! Dataset engine abstraction (versioned dataset storage with remotes).

use crate::error::EnvError;
use crate::types::{DatasetLog, DatasetRef, PeerId, ProfileId};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Content-addressed dataset storage owned by one actor.
#[async_trait]
pub trait DatasetEngine: Send + Sync + 'static {
    /// Saves a new version of `name` with the body read from `body_path`.
    async fn save_version(&self, name: &str, body_path: &Path) -> Result<DatasetRef, EnvError>;

    /// Pushes a saved version to a registered remote.
    async fn push_to_remote(&self, reference: &DatasetRef, remote_name: &str) -> Result<(), EnvError>;

    /// Pulls a version from the remote listening at `remote_addr`.
    async fn pull_from_remote(&self, reference: &DatasetRef, remote_addr: &str) -> Result<(), EnvError>;

    /// Lists every dataset log held locally.
    async fn list_logs(&self) -> Result<Vec<DatasetLog>, EnvError>;

    /// Registers (or replaces) a named remote.
    fn set_remote(&self, name: &str, peer: &PeerId);

    /// Makes this engine accept pushes and serve pulls, reporting to `hooks`.
    fn enable_remote(&self, hooks: Arc<dyn RemoteHooks>);
}

/// Callbacks a remote invokes while serving other actors.
///
/// Returning an error from a pre-check rejects the transfer.
pub trait RemoteHooks: Send + Sync + 'static {
    /// Called before a push is accepted.
    fn push_pre_check(&self, _from: &ProfileId, _reference: &DatasetRef) -> Result<(), EnvError> {
        Ok(())
    }

    /// Called once a pushed dataset has been stored.
    fn dataset_pushed(&self, from: &ProfileId, reference: &DatasetRef);

    /// Called once a dataset has been served to a puller.
    fn dataset_pulled(&self, by: &ProfileId, reference: &DatasetRef);
}
