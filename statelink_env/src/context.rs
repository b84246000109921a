//! Core environment context trait shared by the backend and the client.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for environment interaction.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// Consensus deadlines, command timestamps and session keys all come from
/// here, so a simulation run is reproducible from its seed.
#[async_trait]
pub trait StatelinkContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Consensus windows and sweep deadlines are measured against this.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for command timestamps.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task (client queue pump, consensus sweeper).
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Generates a signing key from a seed extension.
    ///
    /// Session identity proofs are signed with keys produced here. The
    /// simulation combines its global seed with `seed_extension` so every
    /// participant's key is reproducible.
    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey;

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
