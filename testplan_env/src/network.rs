//! Peer transport abstraction for test plan actors.

use crate::error::EnvError;
use crate::types::{ConnectionEvent, NetworkConfig, PeerEndpoint, PeerId, ProfileId};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Abstraction for the peer-to-peer transport an actor runs on.
///
/// # Implementations
///
/// - **Production**: wraps a real p2p host (dialing, stream muxing)
/// - **Simulation**: in-process swarm with partitions and latency
///
/// # Connection flow
///
/// ```text
/// Actor A                    Transport                   Actor B
///   |                           |                          |
///   |-- connect(B) ------------>|                          |
///   |<-- PeerConnected(B) ------|-- PeerConnected(A) ----->|
///   |-- open_stream(B, proto) ->|                          |
///   |<-- ProfileConnected(B) ---|-- ProfileConnected(A) -->|
/// ```
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Returns this actor's own endpoint.
    fn local_endpoint(&self) -> PeerEndpoint;

    /// Records addresses for a peer in the local address book.
    fn add_addrs(&self, peer: &PeerId, addrs: &[String]);

    /// Returns the known addresses of a peer (empty if unknown).
    fn addrs(&self, peer: &PeerId) -> Vec<String>;

    /// Establishes a connection to a peer.
    ///
    /// # Returns
    /// * `Ok(())` - Connected (or already connected)
    /// * `Err(EnvError::PeerUnreachable)` - Peer cannot be reached
    async fn connect(&self, endpoint: &PeerEndpoint) -> Result<(), EnvError>;

    /// Opens a protocol stream to an already-connected peer.
    async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<(), EnvError>;

    /// Subscribes to this actor's connection events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Lists every profile this actor has exchanged with, as `(id, peername)`.
    fn known_profiles(&self) -> Vec<(ProfileId, String)>;
}

/// Applies link shapes on behalf of a node when the run is under
/// simulated-network control.
#[async_trait]
pub trait NetworkShaper: Send + Sync + 'static {
    /// Applies the configuration to every link of the calling node.
    async fn apply(&self, config: &NetworkConfig) -> Result<(), EnvError>;
}
