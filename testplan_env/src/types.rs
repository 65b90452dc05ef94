//! Common types shared by every test plan node.

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use uuid::Uuid;

/// Transport-level identifier of a peer.
///
/// Derived from the peer's Ed25519 public key, so two nodes can only share
/// a `PeerId` if they share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derives a PeerId from a public key (lowercase hex of the key bytes).
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let hex: String = key.as_bytes().iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Wraps an already-encoded identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the full encoded identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        let end = self.0.len().min(8);
        write!(f, "{}", &self.0[..end])
    }
}

/// Durable profile identifier of an actor (survives transport restarts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub Uuid);

impl ProfileId {
    /// Creates a new random ProfileId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic ProfileId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A dialable endpoint: peer identifier plus its listen addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerEndpoint {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}

/// What one node publishes about itself during info exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorInfo {
    /// Sequence number within the run
    pub seq: u64,

    /// Human-readable name
    pub peername: String,

    /// Durable profile identifier
    pub profile_id: ProfileId,

    /// Transport endpoint
    pub endpoint: PeerEndpoint,
}

impl ActorInfo {
    /// Shorthand for the endpoint's peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.endpoint.id
    }
}

/// Name of a barrier/signal state in the sync service.
///
/// The service shares one counter per name for the whole run, so a name
/// must carry exactly one meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateName(Cow<'static, str>);

impl StateName {
    /// Creates a state name usable in `const` items.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Creates a state name from an owned string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape of a simulated network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkShape {
    /// One-way latency added to every operation on the link
    pub latency: Duration,

    /// Bandwidth in bytes per second
    pub bandwidth: u64,
}

impl Default for LinkShape {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            bandwidth: 10 << 20, // 10MiB
        }
    }
}

/// Link-shaping request a node issues during network setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network to control ("default" is the only one)
    pub network: String,

    /// Setting this to false disconnects the node from the network
    pub enable: bool,

    /// Shape applied to every link of this node
    pub default: LinkShape,

    /// State signalled once the shape has been applied
    pub callback_state: StateName,
}

/// Connection notifications emitted by a peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A transport-level connection to a peer was established
    PeerConnected(PeerEndpoint),

    /// A profile exchange with a peer completed
    ProfileConnected {
        profile_id: ProfileId,
        peername: String,
    },
}

/// Discriminant of [`ConnectionEvent`], used as an event-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    PeerConnected,
    ProfileConnected,
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::PeerConnected(_) => ConnectionEventKind::PeerConnected,
            ConnectionEvent::ProfileConnected { .. } => ConnectionEventKind::ProfileConnected,
        }
    }
}

/// Reference to a saved dataset version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Owner's peername
    pub peername: String,

    /// Dataset name
    pub name: String,

    /// Content path of the version (empty when unresolved)
    pub path: String,
}

impl DatasetRef {
    /// Creates an unresolved reference to `peername/name`.
    pub fn named(peername: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peername: peername.into(),
            name: name.into(),
            path: String::new(),
        }
    }

    /// Returns the `peername/name` alias without the version path.
    pub fn alias(&self) -> String {
        format!("{}/{}", self.peername, self.name)
    }
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}/{}", self.peername, self.name)
        } else {
            write!(f, "{}/{}@{}", self.peername, self.name, self.path)
        }
    }
}

/// One dataset history held in a node's logbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetLog {
    /// Dataset name
    pub name: String,

    /// Peername of the author
    pub author: String,

    /// Version paths, oldest first
    pub versions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn test_peer_id_from_key_is_stable() {
        let key = SigningKey::generate(&mut OsRng);
        let a = PeerId::from_public_key(&key.verifying_key());
        let b = PeerId::from_public_key(&key.verifying_key());

        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn test_profile_id_from_seed() {
        assert_eq!(ProfileId::from_seed(7), ProfileId::from_seed(7));
        assert_ne!(ProfileId::from_seed(7), ProfileId::from_seed(8));
    }

    #[test]
    fn test_dataset_ref_display() {
        let mut r = DatasetRef::named("amber_otter", "megajoules");
        assert_eq!(r.to_string(), "amber_otter/megajoules");

        r.path = "/sim/abc".to_string();
        assert_eq!(r.to_string(), "amber_otter/megajoules@/sim/abc");
        assert_eq!(r.alias(), "amber_otter/megajoules");
    }

    #[test]
    fn test_event_kind() {
        let ev = ConnectionEvent::ProfileConnected {
            profile_id: ProfileId::from_seed(1),
            peername: "x".to_string(),
        };
        assert_eq!(ev.kind(), ConnectionEventKind::ProfileConnected);
    }
}
