//! Test Plan Environment Abstraction Layer
//!
//! This crate defines the narrow interfaces through which test plan nodes
//! reach everything outside the coordination layer:
//! - **Sync service**: counting barriers and broadcast topics shared by all
//!   nodes of a run (`SyncService`)
//! - **Peer transport**: dialing, protocol streams, connection events
//!   (`PeerTransport`, `NetworkShaper`)
//! - **Dataset engine**: versioned dataset storage with remotes
//!   (`DatasetEngine`, `RemoteHooks`)
//!
//! An in-process sync service (`LocalSyncService`) is included so a whole
//! run can execute inside one process.
//!
//! # Example
//!
//! ```ignore
//! use testplan_env::{LocalSyncService, StateName, SyncService};
//!
//! const READY: StateName = StateName::from_static("ready");
//!
//! let service = LocalSyncService::new();
//! let client = service.client();
//! let seq = client.signal_and_wait(&READY, 1).await?;
//! ```

mod dataset;
mod error;
mod network;
mod sync;
mod tokio_impl;
mod types;

pub use dataset::{DatasetEngine, RemoteHooks};
pub use error::EnvError;
pub use network::{NetworkShaper, PeerTransport};
pub use sync::{Barrier, Subscription, SyncService, SyncServiceExt, Topic, TypedSubscription};
pub use tokio_impl::{LocalSyncClient, LocalSyncService};
pub use types::{
    ActorInfo, ConnectionEvent, ConnectionEventKind, DatasetLog, DatasetRef, LinkShape, NetworkConfig,
    PeerEndpoint, PeerId, ProfileId, StateName,
};
