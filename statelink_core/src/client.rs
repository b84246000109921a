//! Optimistic client session and its serial command queue.
//!
//! The client executes player-level commands against a local cache of its
//! record for immediate feedback, then hands the request to a FIFO queue
//! that keeps exactly one submission in flight. Backend responses are
//! reconciled afterwards; the backend is always right.
//!
//! # Flow
//!
//! ```text
//! execute(cmd) ──► local route ──┬─ SessionOnly ─► session state (no submit)
//!                                ├─ Optimistic ──► cache ─► digest ─┐
//!                                └─ Derived ─────► from frame / vote ┤
//!                                                                    ▼
//!                          CommandQueue ─► transport ─► backend ─► reconcile
//!                                │  retry on TransportFailure         │
//!                                └──────────── resync ◄───────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let client = ClientSession::connect(ctx, transport, ClientConfig::default()).await?;
//! client.execute(&CompleteMilestone { milestone: Milestone::Intro }).await?;
//! client.settle().await;
//! ```

use crate::codec::encode_fields;
use crate::command::{AccessLevel, GameCommand};
use crate::config::{ClientConfig, ClientVersion};
use crate::consensus::ConsensusCommand;
use crate::context::{execute_atomically, Dispatch, ExecutionFailure, SessionState};
use crate::error::ClientError;
use crate::events::OutcomeBus;
use crate::frame::{Derivation, FrameDerived, MatchFrame, SimulationValues};
use crate::logic::GameConfig;
use crate::record::{PlayerRecord, StateDigest};
use crate::router::{ExecutionRouter, LocalRoute};
use crate::trust::IdentityProof;
use ed25519_dalek::SigningKey;
use serde::Serialize;
use statelink_env::{
    BackendTransport, FieldBag, PlayerId, RequestEnvelope, ResponseEnvelope, ResponseStatus,
    SessionId, StatelinkContext,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

/// Immediate result of a local call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Applied to the local cache and queued for the backend
    Applied { events: Vec<&'static str> },
    /// A derivation guard held locally; nothing submitted
    NoOp(&'static str),
    /// Queued without local execution (votes, elevated commands)
    Submitted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub submitted: u64,
    pub applied: u64,
    pub noops: u64,
    pub pending: u64,
    pub rejected: u64,
    pub retries: u64,
    pub transport_failures: u64,
    pub resyncs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    applied: AtomicU64,
    noops: AtomicU64,
    pending: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    transport_failures: AtomicU64,
    resyncs: AtomicU64,
}

/// Local view of the player's state.
#[derive(Debug, Clone)]
struct ClientCache {
    record: PlayerRecord,
    session: SessionState,
    config_version: u64,
}

/// A request waiting for its authoritative outcome.
struct Queued {
    request: RequestEnvelope,
    /// Digest of the cache right after the optimistic step
    expected: Option<StateDigest>,
    /// The local cache already carries this command's effects
    optimistic: bool,
    /// Cache generation the optimistic step ran against
    generation: u64,
}

struct QueueShared<Ctx, Tx> {
    ctx: Arc<Ctx>,
    transport: Arc<Tx>,
    config: ClientConfig,
    player: PlayerId,
    cache: Arc<AsyncMutex<ClientCache>>,
    pending: Mutex<VecDeque<Queued>>,
    pumping: AtomicBool,
    idle: Notify,
    /// Bumped whenever a resync replaces the cache
    generation: AtomicU64,
    counters: Counters,
}

/// FIFO of outgoing requests with one in flight at a time.
pub struct CommandQueue<Ctx, Tx> {
    shared: Arc<QueueShared<Ctx, Tx>>,
}

impl<Ctx, Tx> CommandQueue<Ctx, Tx>
where
    Ctx: StatelinkContext,
    Tx: BackendTransport,
{
    fn new(
        ctx: Arc<Ctx>,
        transport: Arc<Tx>,
        cache: Arc<AsyncMutex<ClientCache>>,
        config: ClientConfig,
        player: PlayerId,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                ctx,
                transport,
                config,
                player,
                cache,
                pending: Mutex::new(VecDeque::new()),
                pumping: AtomicBool::new(false),
                idle: Notify::new(),
                generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Appends a request and makes sure a pump is running. Never blocks.
    fn enqueue(&self, queued: Queued) {
        match self.shared.pending.lock() {
            Ok(mut pending) => pending.push_back(queued),
            Err(_) => {
                warn!(player = %self.shared.player, "command queue poisoned; request dropped");
                return;
            }
        }
        if !self.shared.pumping.swap(true, Ordering::SeqCst) {
            let shared = Arc::clone(&self.shared);
            self.shared.ctx.spawn("command-queue", async move {
                shared.pump().await;
            });
        }
    }

    /// Requests waiting behind the one in flight.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue_empty()
    }

    /// Resolves once every queued request has its outcome.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if !self.shared.pumping.load(Ordering::SeqCst) && self.shared.queue_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.shared.counters;
        ClientStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            noops: c.noops.load(Ordering::Relaxed),
            pending: c.pending.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            transport_failures: c.transport_failures.load(Ordering::Relaxed),
            resyncs: c.resyncs.load(Ordering::Relaxed),
        }
    }
}

impl<Ctx, Tx> QueueShared<Ctx, Tx>
where
    Ctx: StatelinkContext,
    Tx: BackendTransport,
{
    fn queue_empty(&self) -> bool {
        self.pending.lock().map(|p| p.is_empty()).unwrap_or(true)
    }

    fn next(&self) -> Option<Queued> {
        self.pending.lock().ok().and_then(|mut p| p.pop_front())
    }

    async fn pump(self: Arc<Self>) {
        loop {
            match self.next() {
                Some(queued) => self.deliver(queued).await,
                None => {
                    self.pumping.store(false, Ordering::SeqCst);
                    // An enqueue may have raced the empty check
                    if !self.queue_empty() && !self.pumping.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    self.idle.notify_waiters();
                    return;
                }
            }
        }
    }

    /// Submits one request, retrying transport failures with the same
    /// request and timestamp.
    async fn deliver(&self, queued: Queued) {
        let command = queued.request.command.clone();
        let attempts = self.config.max_attempts.max(1);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=attempts {
            match self.transport.submit(queued.request.clone()).await {
                Ok(response) => {
                    self.reconcile(&queued, response).await;
                    return;
                }
                Err(err) => {
                    self.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                    if !err.is_retryable() || attempt == attempts {
                        warn!(player = %self.player, command = %command, attempt, error = %err, "submission abandoned");
                        break;
                    }
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(player = %self.player, command = %command, attempt, error = %err, "retrying submission");
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    self.ctx.sleep(Duration::from_millis(backoff)).await;
                }
            }
        }

        // Unknown whether the backend applied it: take its word for the state
        self.resync_logged().await;
    }

    async fn reconcile(&self, queued: &Queued, response: ResponseEnvelope) {
        let command = queued.request.command.as_str();
        if let Some(version) = response.config_version {
            let mut cache = self.cache.lock().await;
            if version > cache.config_version {
                info!(player = %self.player, version, "backend runs a newer configuration");
                cache.config_version = version;
            }
        }

        let resync = match response.status {
            ResponseStatus::Applied => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                // A resync since the optimistic step dropped this command's effects
                let replaced = queued.optimistic && queued.generation != self.generation.load(Ordering::SeqCst);
                replaced || match &queued.expected {
                    Some(expected) => {
                        let authoritative = StateDigest::read_from(&response.fields);
                        let diverged = expected.diverging_sections(&authoritative);
                        if !diverged.is_empty() {
                            warn!(player = %self.player, command, sections = ?diverged, "cache diverged from backend");
                        }
                        !diverged.is_empty()
                    }
                    None => false,
                }
            }
            ResponseStatus::NoOp => {
                self.counters.noops.fetch_add(1, Ordering::Relaxed);
                debug!(player = %self.player, command, reason = ?response.message, "backend no-op");
                queued.optimistic
            }
            ResponseStatus::Pending => {
                self.counters.pending.fetch_add(1, Ordering::Relaxed);
                false
            }
            ResponseStatus::Rejected => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                info!(
                    player = %self.player,
                    command,
                    code = response.error_code.as_deref().unwrap_or("unknown"),
                    "backend rejected command"
                );
                queued.optimistic
            }
        };

        if resync {
            self.resync_logged().await;
        }
    }

    async fn resync(&self) -> Result<(), ClientError> {
        let state = self.transport.fetch_state(self.player).await?;
        let record = PlayerRecord::from_fields(&state)?;
        let mut cache = self.cache.lock().await;
        cache.record = record;
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(cache);
        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        debug!(player = %self.player, "cache resynchronized");
        Ok(())
    }

    async fn resync_logged(&self) {
        if let Err(err) = self.resync().await {
            warn!(player = %self.player, error = %err, "resync failed");
        }
    }
}

/// A connected player: local cache, signing key and command queue.
pub struct ClientSession<Ctx, Tx>
where
    Ctx: StatelinkContext,
    Tx: BackendTransport,
{
    ctx: Arc<Ctx>,
    config: ClientConfig,
    game: GameConfig,
    router: ExecutionRouter,
    player: PlayerId,
    session: SessionId,
    signing_key: SigningKey,
    credentials: Option<Vec<u8>>,
    cache: Arc<AsyncMutex<ClientCache>>,
    queue: CommandQueue<Ctx, Tx>,
    bus: Arc<OutcomeBus>,
    last_timestamp: AtomicU64,
}

impl<Ctx, Tx> ClientSession<Ctx, Tx>
where
    Ctx: StatelinkContext,
    Tx: BackendTransport,
{
    /// Opens a backend session and seeds the cache from the grant.
    pub async fn connect(ctx: Arc<Ctx>, transport: Arc<Tx>, config: ClientConfig) -> Result<Self, ClientError> {
        let player = transport.local_player();
        let (high, low) = player.as_uuid().as_u64_pair();
        let signing_key = ctx.derive_signing_key(high ^ low);

        let grant = transport
            .open_session(player, signing_key.verifying_key().to_bytes())
            .await?;
        let cache = Arc::new(AsyncMutex::new(ClientCache {
            record: PlayerRecord::from_fields(&grant.state)?,
            session: SessionState::default(),
            config_version: config.config_version.max(grant.config_version),
        }));
        info!(player = %player, session = %grant.session, "client connected");

        Ok(Self {
            queue: CommandQueue::new(Arc::clone(&ctx), transport, Arc::clone(&cache), config.clone(), player),
            ctx,
            config,
            game: GameConfig::default(),
            router: ExecutionRouter::new(),
            player,
            session: grant.session,
            signing_key,
            credentials: None,
            cache,
            bus: OutcomeBus::shared(),
            last_timestamp: AtomicU64::new(0),
        })
    }

    pub fn with_game_config(mut self, game: GameConfig) -> Self {
        self.game = game;
        self
    }

    /// Elevated credentials attached to Service/Admin submissions.
    pub fn with_credentials(mut self, credentials: Vec<u8>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn player(&self) -> PlayerId {
        self.player
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn client_version(&self) -> ClientVersion {
        self.config.client_version
    }

    /// Locally published outcome events.
    pub fn bus(&self) -> Arc<OutcomeBus> {
        Arc::clone(&self.bus)
    }

    pub fn queue(&self) -> &CommandQueue<Ctx, Tx> {
        &self.queue
    }

    pub fn stats(&self) -> ClientStats {
        self.queue.stats()
    }

    /// Snapshot of the local record cache.
    pub async fn record(&self) -> PlayerRecord {
        self.cache.lock().await.record.clone()
    }

    pub async fn session_state(&self) -> SessionState {
        self.cache.lock().await.session.clone()
    }

    pub async fn config_version(&self) -> u64 {
        self.cache.lock().await.config_version
    }

    /// Waits until every queued command has its authoritative outcome.
    pub async fn settle(&self) {
        self.queue.idle().await;
    }

    /// Overwrites the cache with the backend's record.
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.queue.shared.resync().await
    }

    // ========================================================================
    // LOCAL EXECUTION
    // ========================================================================

    /// Executes a command locally (where its mode allows) and queues it.
    ///
    /// A `DomainError` raised locally is returned without submitting.
    pub async fn execute<C: GameCommand>(&self, command: &C) -> Result<LocalOutcome, ClientError> {
        let meta = C::METADATA;
        match self.router.local_route(&meta) {
            LocalRoute::Refuse => Err(ClientError::ServerOnly(meta.type_tag.to_string())),
            LocalRoute::Derived => Err(ClientError::WrongMode {
                command: meta.type_tag.to_string(),
                requested: "execute".to_string(),
            }),
            LocalRoute::SessionOnly => {
                let mut cache = self.cache.lock().await;
                let applied = self.run_locally(command, &cache, None).await?;
                cache.session = applied.session;
                Ok(self.publish_local(applied.events))
            }
            LocalRoute::Optimistic if meta.access > AccessLevel::Player => {
                let request = self.request(meta.type_tag, encode_fields(command)?);
                let request = match &self.credentials {
                    Some(token) => request.with_credentials(token.clone()),
                    None => request,
                };
                self.queue.enqueue(Queued { request, expected: None, optimistic: false, generation: 0 });
                Ok(LocalOutcome::Submitted)
            }
            LocalRoute::Optimistic => {
                let fields = encode_fields(command)?;
                self.apply_optimistically(command, fields, None).await
            }
        }
    }

    /// Derives a simulation-authoritative command from the local replica's
    /// frame, applies it optimistically and submits it as a trigger.
    pub async fn execute_from_frame<C: FrameDerived>(&self, frame: &MatchFrame) -> Result<LocalOutcome, ClientError> {
        let values = SimulationValues::from_frame(frame, self.player);
        match C::derive_from_frame(frame, &values) {
            Derivation::NoOp(reason) => {
                debug!(player = %self.player, command = C::METADATA.type_tag, reason, "local derivation no-op");
                Ok(LocalOutcome::NoOp(reason))
            }
            Derivation::Apply(command) => {
                let fields = encode_fields(&command)?;
                self.apply_optimistically(&command, fields, Some(&values)).await
            }
        }
    }

    /// Signs and submits a consensus vote. Votes target another record, so
    /// nothing runs locally.
    pub async fn submit_vote<C>(&self, command: &C) -> Result<LocalOutcome, ClientError>
    where
        C: ConsensusCommand + GameCommand,
    {
        let fields = encode_fields(command)?;
        let proof = IdentityProof::sign(&self.signing_key, self.player, self.session, &command.action_id(), &fields);
        let request = self
            .request(C::METADATA.type_tag, fields)
            .with_proof(proof.to_bytes());
        self.queue.enqueue(Queued { request, expected: None, optimistic: false, generation: 0 });
        Ok(LocalOutcome::Submitted)
    }

    async fn apply_optimistically(
        &self,
        command: &dyn crate::command::AnyCommand,
        fields: FieldBag,
        values: Option<&SimulationValues>,
    ) -> Result<LocalOutcome, ClientError> {
        let mut cache = self.cache.lock().await;
        let applied = self.run_locally(command, &cache, values).await?;
        cache.record = applied.record;
        let expected = cache.record.digest();

        // Queue while still holding the cache so requests follow cache order
        let request = self.request(command.metadata().type_tag, fields);
        self.queue.enqueue(Queued {
            request,
            expected: Some(expected),
            optimistic: true,
            generation: self.queue.shared.generation.load(Ordering::SeqCst),
        });
        drop(cache);

        Ok(self.publish_local(applied.events))
    }

    async fn run_locally(
        &self,
        command: &dyn crate::command::AnyCommand,
        cache: &ClientCache,
        values: Option<&SimulationValues>,
    ) -> Result<crate::context::Applied, ClientError> {
        let dispatch = Dispatch {
            player: self.player,
            access: AccessLevel::Player,
            record: &cache.record,
            session: &cache.session,
            values,
            config: &self.game,
        };
        match execute_atomically(command, dispatch).await {
            Ok(applied) => Ok(applied),
            Err(ExecutionFailure::Domain(err)) => {
                debug!(player = %self.player, command = command.metadata().type_tag, %err, "rejected locally");
                Err(err.into())
            }
            Err(ExecutionFailure::Panicked(cause)) => Err(ClientError::Unexpected(cause)),
        }
    }

    fn publish_local(&self, events: Vec<Box<dyn crate::events::OutcomeEvent>>) -> LocalOutcome {
        self.bus.publish_all(&events);
        LocalOutcome::Applied {
            events: events.iter().map(|e| e.name()).collect(),
        }
    }

    fn request(&self, command: &str, fields: FieldBag) -> RequestEnvelope {
        RequestEnvelope::new(self.player, self.session, command, fields, self.next_timestamp())
            .with_client_version(self.config.client_version.to_string())
            .with_config_version(self.config.config_version)
    }

    /// Strictly increasing, so the backend's ordering check never trips on
    /// two commands created in the same millisecond.
    fn next_timestamp(&self) -> u64 {
        let now = self.ctx.unix_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }
}
