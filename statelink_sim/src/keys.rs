//! Deterministic key provider for simulation.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statelink_core::TokenFactory;
use std::collections::HashMap;

/// Provides deterministic keys derived from seeds.
///
/// Two kinds of key material live in a simulation:
/// - The backend's Biscuit root, which mints Service and Admin credentials
/// - Forged participant keys, used by scenarios that impersonate a player
///   with a key the backend never bound to a session
pub struct DeterministicKeyProvider {
    /// Master seed
    master_seed: u64,

    /// Cache of generated keys by participant index
    key_cache: HashMap<u64, SigningKey>,

    /// Root signing key of the simulation
    root_key: SigningKey,
}

impl DeterministicKeyProvider {
    /// Creates a new key provider with the given master seed.
    pub fn new(master_seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(master_seed);
        let root_key = SigningKey::generate(&mut rng);

        Self {
            master_seed,
            key_cache: HashMap::new(),
            root_key,
        }
    }

    pub fn root_public_key(&self) -> VerifyingKey {
        self.root_key.verifying_key()
    }

    /// Returns the credential root as a biscuit-auth KeyPair.
    ///
    /// biscuit-auth has its own key type, so a separate key is derived from
    /// the seed with a different salt.
    pub fn biscuit_root_key(&self) -> biscuit_auth::KeyPair {
        let biscuit_seed = self.master_seed.wrapping_mul(0x3c6ef372fe94f82b);
        let mut rng = ChaCha8Rng::seed_from_u64(biscuit_seed);
        biscuit_auth::KeyPair::new_with_rng(&mut rng)
    }

    /// Token factory rooted at `biscuit_root_key`.
    pub fn token_factory(&self) -> TokenFactory {
        TokenFactory::new(self.biscuit_root_key())
    }

    /// Generates or retrieves a forged key for participant `index`.
    ///
    /// Derived as `master_seed * golden + index * prime`, so adding
    /// participants never changes earlier keys.
    pub fn forged_key(&mut self, index: u64) -> SigningKey {
        if let Some(key) = self.key_cache.get(&index) {
            return key.clone();
        }

        let seed = self
            .master_seed
            .wrapping_mul(0x9e3779b97f4a7c15)
            .wrapping_add(index.wrapping_mul(0x517cc1b727220a95));
        let key = SigningKey::generate(&mut ChaCha8Rng::seed_from_u64(seed));

        self.key_cache.insert(index, key.clone());
        key
    }
}
