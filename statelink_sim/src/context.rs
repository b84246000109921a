//! Virtual clock and seeded entropy shared by every simulated participant.
//!
//! The backend, each client and the network all hold a clone of one
//! `SimContext`. Consensus deadlines, request timestamps, match seeds and
//! session keys therefore all derive from the run's master seed.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statelink_env::StatelinkContext;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2024-01-01 00:00:00 UTC, in milliseconds.
const DEFAULT_EPOCH_MS: u64 = 1_704_067_200_000;

struct SimState {
    /// Virtual time since the run started
    elapsed: Duration,

    /// Draws for match seeds and submission order
    rng: ChaCha8Rng,
}

/// Deterministic `StatelinkContext` for the simulation.
#[derive(Clone)]
pub struct SimContext {
    seed: u64,
    epoch: SystemTime,
    state: Arc<Mutex<SimState>>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            epoch: UNIX_EPOCH + Duration::from_millis(DEFAULT_EPOCH_MS),
            state: Arc::new(Mutex::new(SimState {
                elapsed: Duration::ZERO,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Moves the wall clock that virtual time zero maps to.
    pub fn with_epoch_millis(mut self, epoch_ms: u64) -> Self {
        self.epoch = UNIX_EPOCH + Duration::from_millis(epoch_ms);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A panicking command must not freeze the clock for everyone else
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advances virtual time and returns the new reading.
    pub fn advance(&self, duration: Duration) -> Duration {
        let mut state = self.state();
        state.elapsed += duration;
        state.elapsed
    }

    /// Next value of the shared deterministic stream.
    pub fn next_u64(&self) -> u64 {
        self.state().rng.next_u64()
    }
}

/// SplitMix64 finalizer; spreads neighbouring participant ids apart.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[async_trait]
impl StatelinkContext for SimContext {
    fn now(&self) -> Duration {
        self.state().elapsed
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    /// Jumps the clock instead of waiting. Retry backoff therefore costs
    /// no real time.
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        tokio::spawn(async move {
            future.await;
            tracing::trace!(task = %name, "sim task finished");
        });
    }

    /// Session keys are a pure function of the master seed and the
    /// participant, independent of how many draws the run has made.
    fn derive_signing_key(&self, seed_extension: u64) -> SigningKey {
        let mut key_rng = ChaCha8Rng::seed_from_u64(mix(self.seed) ^ seed_extension);
        SigningKey::generate(&mut key_rng)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_moves_only_when_advanced() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.advance(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(ctx.advance(Duration::from_millis(500)), Duration::from_millis(1500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_request_timestamps_follow_virtual_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.unix_millis(), DEFAULT_EPOCH_MS);

        ctx.advance(Duration::from_millis(250));
        assert_eq!(ctx.unix_millis(), DEFAULT_EPOCH_MS + 250);

        let shifted = SimContext::new(42).with_epoch_millis(5_000);
        assert_eq!(shifted.unix_millis(), 5_000);
    }

    #[tokio::test]
    async fn test_backoff_sleep_is_free() {
        let ctx = SimContext::new(42);
        let started = std::time::Instant::now();
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.now(), Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_session_keys_ignore_draw_order() {
        let a = SimContext::new(42);
        let b = SimContext::new(42);
        for _ in 0..5 {
            b.next_u64();
        }

        assert_eq!(a.derive_signing_key(1).to_bytes(), b.derive_signing_key(1).to_bytes());
        assert_ne!(a.derive_signing_key(1).to_bytes(), a.derive_signing_key(2).to_bytes());
        assert_ne!(
            a.derive_signing_key(1).to_bytes(),
            SimContext::new(43).derive_signing_key(1).to_bytes()
        );
    }

    #[test]
    fn test_match_seed_stream_is_reproducible() {
        let a = SimContext::new(7);
        let b = SimContext::new(7);
        let xs: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
        let ys: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
        assert_eq!(xs, ys);
        assert_eq!(a.seed(), 7);
    }

    #[test]
    fn test_clones_share_clock_and_stream() {
        let backend = SimContext::new(42);
        let client = backend.clone();

        backend.advance(Duration::from_secs(5));
        assert_eq!(client.now(), Duration::from_secs(5));

        let fresh = SimContext::new(42);
        fresh.next_u64();
        let second = fresh.next_u64();
        backend.next_u64();
        assert_eq!(client.next_u64(), second);
    }
}
