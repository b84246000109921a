//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::keys::DeterministicKeyProvider;
use crate::network::{SimNetworkController, SimTransport};
use crate::oracle::{MatchOracle, TrustedSnapshots};

use statelink_core::{
    standard_registry, Backend, BackendConfig, ClientConfig, ClientError, ClientSession,
    DispatchError, GameSession, TokenFactory,
};
use statelink_env::{EnvError, MatchId, PlayerId, StatelinkContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A connected simulated client.
pub type SimClient = ClientSession<SimContext, SimTransport>;

/// Errors that stop a scenario.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Backend: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Client: {0}")]
    Client(#[from] ClientError),

    /// A raw envelope sent by a scenario never got an answer
    #[error("Transport: {0}")]
    Transport(#[from] EnvError),

    #[error("Config: {0}")]
    Config(String),

    /// A scenario assertion did not hold
    #[error("Check failed: {0}")]
    Check(String),
}

impl SimError {
    pub fn check(what: impl Into<String>) -> Self {
        Self::Check(what.into())
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of match participants (clients) to connect
    pub participants: usize,

    /// Backend tuning (quorum, window, environment)
    pub backend: BackendConfig,

    /// Client tuning (retries, backoff)
    pub client: ClientConfig,

    /// Frame budget for one match
    pub max_frames: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            participants: 4,
            backend: BackendConfig::default(),
            client: ClientConfig::default(),
            max_frames: 10_000,
        }
    }
}

impl SimConfig {
    /// Loads a `BackendConfig` JSON document into this configuration.
    pub fn with_backend_file(mut self, path: impl AsRef<Path>) -> Result<Self, SimError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))?;
        self.backend = BackendConfig::from_json(&json)
            .map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(self)
    }
}

/// The SimWorld - one backend, its trusted snapshots and the network.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Key provider (deterministic crypto)
    pub keys: DeterministicKeyProvider,

    /// Mints elevated credentials for the backend's root authority
    pub tokens: TokenFactory,

    /// The authoritative backend
    pub backend: Arc<Backend<SimContext>>,

    /// Frames the backend trusts, fed from the authority's replicas
    pub snapshots: Arc<TrustedSnapshots>,

    /// Network controller for fault injection
    pub network: Arc<SimNetworkController>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let key_seed = config.seed.wrapping_mul(0x517cc1b727220a95);

        let context = SimContext::shared(config.seed);
        let keys = DeterministicKeyProvider::new(key_seed);
        let tokens = keys.token_factory();
        let snapshots = Arc::new(TrustedSnapshots::new());

        let backend = Backend::new(Arc::clone(&context), standard_registry(), tokens.authority())
            .with_config(config.backend.clone())
            .with_snapshot_source(Arc::clone(&snapshots) as Arc<dyn statelink_core::SnapshotSource>);

        Self {
            config,
            context,
            keys,
            tokens,
            backend: Arc::new(backend),
            snapshots,
            network: SimNetworkController::shared(),
        }
    }

    /// Player id of participant `index`.
    pub fn player(&self, index: usize) -> PlayerId {
        PlayerId::from_seed(self.config.seed.rotate_left(20) ^ (index as u64 + 1))
    }

    /// Every participant's player id, in roster order.
    pub fn roster(&self) -> Vec<PlayerId> {
        (0..self.config.participants).map(|i| self.player(i)).collect()
    }

    /// Channel for participant `index`.
    pub fn transport(&self, index: usize) -> Arc<SimTransport> {
        Arc::new(SimTransport::new(
            Arc::clone(&self.context),
            Arc::clone(&self.backend),
            Arc::clone(&self.network),
            self.player(index),
        ))
    }

    /// Connects participant `index` with the configured client settings.
    pub async fn connect(&self, index: usize) -> Result<SimClient, SimError> {
        self.connect_with(index, self.config.client.clone()).await
    }

    pub async fn connect_with(&self, index: usize, config: ClientConfig) -> Result<SimClient, SimError> {
        let client = ClientSession::connect(Arc::clone(&self.context), self.transport(index), config).await?;
        debug!(player = %client.player(), session = %client.session(), "participant connected");
        Ok(client)
    }

    /// Connects every participant.
    pub async fn connect_all(&self) -> Result<Vec<SimClient>, SimError> {
        let mut clients = Vec::with_capacity(self.config.participants);
        for index in 0..self.config.participants {
            clients.push(self.connect(index).await?);
        }
        Ok(clients)
    }

    /// Registers a match on the backend and returns the authority replica.
    pub fn start_match(&self, match_id: MatchId, session: GameSession) -> Result<MatchOracle, SimError> {
        let roster = self.roster();
        self.backend
            .register_match(match_id.clone(), roster.iter().copied(), session.clone())?;

        let match_seed = self.config.seed ^ self.context.next_u64();
        let oracle = MatchOracle::new(match_id, match_seed, roster, session);
        self.snapshots.publish(&oracle);
        Ok(oracle)
    }

    /// Runs the authority replica to the end and publishes its final frame.
    pub fn finish_match(&self, oracle: &mut MatchOracle) -> u64 {
        let frames = oracle.run_to_end(self.config.max_frames);
        self.snapshots.publish(oracle);
        frames
    }

    /// Advances virtual time.
    pub fn advance(&self, duration: Duration) {
        self.context.advance(duration);
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Waits until every client has the outcome of everything it queued.
    pub async fn settle(&self, clients: &[SimClient]) {
        for client in clients {
            client.settle().await;
        }
    }

    /// Checks every client's cache matches its authoritative record.
    pub async fn converged(&self, clients: &[SimClient]) -> Result<bool, SimError> {
        for client in clients {
            let authoritative = self.backend.record(client.player())?;
            if client.record().await.digest() != authoritative.digest() {
                debug!(player = %client.player(), "cache differs from backend");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
