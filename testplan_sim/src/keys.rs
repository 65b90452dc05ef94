//! Deterministic node identities for simulation.

use ed25519_dalek::SigningKey;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use testplan_env::{PeerId, ProfileId};

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly", "keen", "lunar",
];
const ANIMALS: &[&str] = &[
    "otter", "badger", "crane", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "jackal", "koala", "lynx",
];

/// Provides deterministic Ed25519 keys and profiles derived from seeds.
///
/// Every identity is a pure function of `(master_seed, index)`: adding
/// nodes to a run never changes the identities of existing ones.
pub struct DeterministicKeyProvider {
    /// Master seed
    master_seed: u64,

    /// Cache of generated keys by node index
    key_cache: HashMap<u64, SigningKey>,
}

impl DeterministicKeyProvider {
    /// Creates a new key provider with the given master seed.
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            key_cache: HashMap::new(),
        }
    }

    fn node_seed(&self, index: u64) -> u64 {
        self.master_seed
            .wrapping_mul(0x9e3779b97f4a7c15) // Golden ratio prime
            .wrapping_add(index.wrapping_mul(0x517cc1b727220a95))
    }

    /// Generates or retrieves the signing key for a node.
    pub fn node_key(&mut self, index: u64) -> SigningKey {
        if let Some(key) = self.key_cache.get(&index) {
            return key.clone();
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.node_seed(index));
        let key = SigningKey::generate(&mut rng);

        self.key_cache.insert(index, key.clone());
        key
    }

    /// Transport identity of a node.
    pub fn peer_id(&mut self, index: u64) -> PeerId {
        PeerId::from_public_key(&self.node_key(index).verifying_key())
    }

    /// Durable profile id of a node.
    pub fn profile_id(&self, index: u64) -> ProfileId {
        ProfileId::from_seed(self.node_seed(index) ^ 0x3c6ef372fe94f82b)
    }

    /// Human-readable peername, unique within a run.
    pub fn peername(&self, index: u64) -> String {
        let mut rng = ChaCha8Rng::seed_from_u64(self.node_seed(index));
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
        let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("node");
        format!("{adjective}_{animal}_{index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_node_keys() {
        let mut provider1 = DeterministicKeyProvider::new(42);
        let mut provider2 = DeterministicKeyProvider::new(42);

        assert_eq!(provider1.node_key(5).to_bytes(), provider2.node_key(5).to_bytes());
        assert_eq!(provider1.peer_id(5), provider2.peer_id(5));
        assert_eq!(provider1.profile_id(5), provider2.profile_id(5));
        assert_eq!(provider1.peername(5), provider2.peername(5));
    }

    #[test]
    fn test_different_nodes_different_identities() {
        let mut provider = DeterministicKeyProvider::new(42);

        assert_ne!(provider.peer_id(0), provider.peer_id(1));
        assert_ne!(provider.profile_id(0), provider.profile_id(1));
        assert_ne!(provider.peername(0), provider.peername(1));
    }

    #[test]
    fn test_key_isolation() {
        // Adding more nodes shouldn't change existing identities
        let mut provider1 = DeterministicKeyProvider::new(42);
        let mut provider2 = DeterministicKeyProvider::new(42);

        let ids1: Vec<_> = (0..3).map(|i| provider1.peer_id(i)).collect();
        let _extra: Vec<_> = (0..10).map(|i| provider2.peer_id(i)).collect();

        for i in 0..3 {
            assert_eq!(ids1[i as usize], provider2.peer_id(i));
        }
    }

    #[test]
    fn test_seed_changes_identities() {
        let mut a = DeterministicKeyProvider::new(1);
        let mut b = DeterministicKeyProvider::new(2);
        assert_ne!(a.peer_id(0), b.peer_id(0));
    }
}
