//! Authoritative backend dispatcher.
//!
//! Owns every persisted player record. Submissions are processed through a
//! fixed pipeline, and all work on one record is serialized through that
//! record's queue.
//!
//! # Pipeline
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ RequestEnvelope                                                │
//! │   │                                                            │
//! │   ▼  session current? client version ok?     (player channel) │
//! │ AccessGate ── AccessDenied                                     │
//! │   │                                                            │
//! │   ▼                                                            │
//! │ ExecutionRouter ─┬─ Direct ─────────────┐                      │
//! │                  ├─ FrameDerived ─ adapter ─┤                  │
//! │                  └─ Consensus ─ resolver ───┤                  │
//! │                                             ▼                  │
//! │            per-record queue ─► execute_atomically ─► save      │
//! │                                             │                  │
//! │                                             ▼                  │
//! │                                        OutcomeBus              │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use crate::access::{AccessGate, Caller, Grant};
use crate::command::{AccessLevel, AnyCommand};
use crate::config::{BackendConfig, ClientVersion};
use crate::consensus::{ConsensusVerdict, ConsensusResolver, MatchRoster, Submission};
use crate::context::{execute_atomically, Dispatch, ExecutionFailure, SessionState};
use crate::error::{DispatchError, ProofError};
use crate::events::OutcomeBus;
use crate::frame::{Derivation, FrameDerivationAdapter, GameSession, SimulationValues, SnapshotSource};
use crate::logic::GameConfig;
use crate::record::{PlayerRecord, StateDigest};
use crate::registry::{CommandHandler, CommandRegistry};
use crate::router::{ExecutionRouter, Route};
use crate::store::{InMemoryRecordStore, RecordStore};
use crate::trust::{CredentialAuthority, IdentityProof, SessionRegistry};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use statelink_env::{
    ActionId, Channel, FieldBag, MatchId, PlayerId, RequestEnvelope, ResponseEnvelope,
    ResponseStatus, SessionGrant, SessionId, StatelinkContext,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Outcome of a submission that was not rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Applied {
        target: PlayerId,
        digest: StateDigest,
        /// Names of the published events, in order
        events: Vec<&'static str>,
        /// Sections whose digest changed
        changed: Vec<String>,
    },
    NoOp {
        reason: String,
    },
    Pending {
        supporters: usize,
        quorum: usize,
    },
}

/// Counters exported for the simulator report.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    noops: AtomicU64,
    pending: AtomicU64,
    domain_errors: AtomicU64,
    access_denied: AtomicU64,
    consensus_failures: AtomicU64,
    unexpected: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub applied: u64,
    pub noops: u64,
    pub pending: u64,
    pub domain_errors: u64,
    pub access_denied: u64,
    pub consensus_failures: u64,
    pub unexpected: u64,
    /// Every other rejection
    pub rejected: u64,
}

/// One FIFO queue per record.
///
/// `tokio::sync::Mutex` hands the lock out in request order, so a later
/// command on a record only starts after the earlier one finished.
#[derive(Default)]
struct RecordLocks {
    locks: Mutex<HashMap<PlayerId, Arc<AsyncMutex<()>>>>,
}

impl RecordLocks {
    async fn acquire(&self, player: PlayerId) -> Result<OwnedMutexGuard<()>, DispatchError> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| DispatchError::unexpected("record lock table poisoned"))?;
            Arc::clone(locks.entry(player).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Drops queues nobody is waiting on.
    fn prune(&self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }
}

/// The single authoritative process for player records.
pub struct Backend<Ctx: StatelinkContext> {
    ctx: Arc<Ctx>,
    config: BackendConfig,
    game: GameConfig,
    registry: CommandRegistry,
    authority: CredentialAuthority,
    gate: AccessGate,
    router: ExecutionRouter,
    frames: FrameDerivationAdapter,
    resolver: Mutex<ConsensusResolver>,
    sessions: RwLock<SessionRegistry>,
    matches: RwLock<MatchRoster>,
    store: Arc<dyn RecordStore>,
    locks: RecordLocks,
    bus: Arc<OutcomeBus>,
    next_session: AtomicU64,
    counters: Counters,
}

impl<Ctx: StatelinkContext> Backend<Ctx> {
    /// Creates a production-configured backend with an in-memory store and
    /// no trusted snapshot source.
    pub fn new(ctx: Arc<Ctx>, registry: CommandRegistry, authority: CredentialAuthority) -> Self {
        let config = BackendConfig::default();
        Self {
            ctx,
            game: GameConfig::default(),
            registry,
            gate: AccessGate::new(authority.clone(), config.environment)
                .with_development_mode(config.development_mode),
            authority,
            router: ExecutionRouter::new(),
            frames: FrameDerivationAdapter::unavailable(),
            resolver: Mutex::new(ConsensusResolver::new(config.consensus.clone())),
            sessions: RwLock::new(SessionRegistry::new()),
            matches: RwLock::new(MatchRoster::new()),
            store: Arc::new(InMemoryRecordStore::new()),
            locks: RecordLocks::default(),
            bus: OutcomeBus::shared(),
            next_session: AtomicU64::new(1),
            counters: Counters::default(),
            config,
        }
    }

    pub fn with_config(mut self, config: BackendConfig) -> Self {
        if config.development_mode {
            warn!(environment = %config.environment, "development mode: access gate admits every level");
        }
        self.gate = AccessGate::new(self.authority.clone(), config.environment)
            .with_development_mode(config.development_mode);
        self.resolver = Mutex::new(ConsensusResolver::new(config.consensus.clone()));
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.frames = FrameDerivationAdapter::new(source);
        self
    }

    pub fn with_game_config(mut self, game: GameConfig) -> Self {
        self.game = game;
        self
    }

    pub fn with_bus(mut self, bus: Arc<OutcomeBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn bus(&self) -> Arc<OutcomeBus> {
        Arc::clone(&self.bus)
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Opens a session: sets up or sanitizes the record, then retires any
    /// earlier session of the player.
    pub async fn open_session(
        &self,
        player: PlayerId,
        public_key: Option<[u8; 32]>,
    ) -> Result<SessionGrant, DispatchError> {
        let key = public_key
            .map(|bytes| VerifyingKey::from_bytes(&bytes))
            .transpose()
            .map_err(|e| ProofError::Malformed(format!("session key: {}", e)))?;

        let guard = self.locks.acquire(player).await?;
        let stored = self.store.load(player)?;
        let mut record = stored.clone().unwrap_or_else(|| PlayerRecord::new(player));
        let mut events = Vec::new();
        let session_state = SessionState::default();

        for handler in self.registry.initialization() {
            let Some(init) = handler.init else { continue };
            let command = init();
            let dispatch = Dispatch {
                player,
                access: AccessLevel::Service,
                record: &record,
                session: &session_state,
                values: None,
                config: &self.game,
            };
            match execute_atomically(command.as_ref(), dispatch).await {
                Ok(applied) => {
                    record = applied.record;
                    events.extend(applied.events);
                }
                Err(ExecutionFailure::Domain(reason)) => {
                    debug!(player = %player, command = handler.metadata.type_tag, %reason, "initialization skipped");
                }
                Err(ExecutionFailure::Panicked(cause)) => {
                    error!(player = %player, command = handler.metadata.type_tag, %cause, "initialization panicked");
                    self.counters.unexpected.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::unexpected(cause));
                }
            }
        }

        if stored.as_ref() != Some(&record) {
            self.store.save(&record)?;
        }
        self.bus.publish_all(&events);
        drop(guard);

        let session = self.allocate_session();
        let retired = self
            .sessions
            .write()
            .map_err(|_| DispatchError::unexpected("session registry poisoned"))?
            .open(player, session, key, self.ctx.now());
        info!(player = %player, session = %session, retired = ?retired, "session opened");

        Ok(SessionGrant {
            player,
            session,
            state: record.to_fields()?,
            config_version: self.config.config_version,
        })
    }

    pub fn close_session(&self, player: PlayerId) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.close(player).is_some(),
            Err(_) => false,
        }
    }

    /// Deletes a player's persisted record and session.
    pub async fn remove_player(&self, player: PlayerId) -> Result<bool, DispatchError> {
        let _guard = self.locks.acquire(player).await?;
        let removed = self.store.remove(player)?;
        self.close_session(player);
        info!(player = %player, removed, "player removed");
        Ok(removed)
    }

    pub fn fetch_state(&self, player: PlayerId) -> Result<FieldBag, DispatchError> {
        Ok(self.record(player)?.to_fields()?)
    }

    pub fn record(&self, player: PlayerId) -> Result<PlayerRecord, DispatchError> {
        self.store
            .load(player)?
            .ok_or(DispatchError::RecordNotFound(player))
    }

    fn allocate_session(&self) -> SessionId {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        match self.ctx.seed() {
            0 => SessionId::new(),
            seed => SessionId::from_seed(seed.rotate_left(32) ^ n),
        }
    }

    // ========================================================================
    // MATCHES
    // ========================================================================

    pub fn register_match(
        &self,
        match_id: MatchId,
        participants: impl IntoIterator<Item = PlayerId>,
        session: GameSession,
    ) -> Result<(), DispatchError> {
        self.matches
            .write()
            .map_err(|_| DispatchError::unexpected("match roster poisoned"))?
            .register(match_id, participants, session);
        Ok(())
    }

    pub fn set_connected(
        &self,
        match_id: &MatchId,
        player: PlayerId,
        connected: bool,
    ) -> Result<(), DispatchError> {
        self.matches
            .write()
            .map_err(|_| DispatchError::unexpected("match roster poisoned"))?
            .set_connected(match_id, player, connected)?;
        Ok(())
    }

    /// Forgets a match and every vote still pending on it.
    pub fn end_match(&self, match_id: &MatchId) -> Result<bool, DispatchError> {
        let ended = self
            .matches
            .write()
            .map_err(|_| DispatchError::unexpected("match roster poisoned"))?
            .end(match_id);
        let dropped = self
            .resolver
            .lock()
            .map_err(|_| DispatchError::unexpected("consensus resolver poisoned"))?
            .forget_match(match_id);
        debug!(match_id = %match_id, dropped, "match ended");
        Ok(ended)
    }

    // ========================================================================
    // CONSENSUS SWEEP
    // ========================================================================

    /// Fails expired consensus actions. Returns their ids.
    pub fn sweep_consensus(&self) -> Vec<ActionId> {
        let expired = match self.resolver.lock() {
            Ok(mut resolver) => resolver.sweep(self.ctx.now()),
            Err(_) => Vec::new(),
        };
        self.counters
            .consensus_failures
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.locks.prune();
        expired
    }

    pub fn pending_consensus(&self) -> usize {
        self.resolver.lock().map(|r| r.pending_count()).unwrap_or(0)
    }

    /// Runs `sweep_consensus` every `interval` until the backend is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let backend = Arc::downgrade(self);
        let ctx = Arc::clone(&self.ctx);
        self.ctx.spawn("consensus-sweeper", async move {
            loop {
                ctx.sleep(interval).await;
                let Some(backend) = backend.upgrade() else {
                    break;
                };
                for action in backend.sweep_consensus() {
                    debug!(action = %action, "swept");
                }
            }
        });
    }

    pub fn stats(&self) -> BackendStats {
        let c = &self.counters;
        BackendStats {
            applied: c.applied.load(Ordering::Relaxed),
            noops: c.noops.load(Ordering::Relaxed),
            pending: c.pending.load(Ordering::Relaxed),
            domain_errors: c.domain_errors.load(Ordering::Relaxed),
            access_denied: c.access_denied.load(Ordering::Relaxed),
            consensus_failures: c.consensus_failures.load(Ordering::Relaxed),
            unexpected: c.unexpected.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    /// Submits one command and returns the wire response.
    pub async fn respond(&self, channel: Channel, request: RequestEnvelope) -> ResponseEnvelope {
        let command = request.command.clone();
        let client_config = request.config_version;

        let mut response = match self.submit(channel, request).await {
            Ok(Dispatched::Applied { digest, .. }) => {
                let mut response = ResponseEnvelope::new(command, ResponseStatus::Applied);
                digest.write_into(&mut response.fields);
                response
            }
            Ok(Dispatched::NoOp { reason }) => {
                let mut response = ResponseEnvelope::new(command, ResponseStatus::NoOp);
                response.message = Some(reason);
                response
            }
            Ok(Dispatched::Pending { supporters, quorum }) => {
                let mut response = ResponseEnvelope::new(command, ResponseStatus::Pending);
                response.fields.insert("supporters".into(), supporters.to_string());
                response.fields.insert("quorum".into(), quorum.to_string());
                response
            }
            Err(err) => ResponseEnvelope::rejected(command, err.code(), err.client_message()),
        };

        if self.config.config_version > client_config {
            response.config_version = Some(self.config.config_version);
        }
        response
    }

    /// Submits one command and returns the typed outcome.
    pub async fn submit(&self, channel: Channel, request: RequestEnvelope) -> Result<Dispatched, DispatchError> {
        let result = self.dispatch(channel, &request).await;
        let c = &self.counters;
        match &result {
            Ok(Dispatched::Applied { .. }) => c.applied.fetch_add(1, Ordering::Relaxed),
            Ok(Dispatched::NoOp { .. }) => c.noops.fetch_add(1, Ordering::Relaxed),
            Ok(Dispatched::Pending { .. }) => c.pending.fetch_add(1, Ordering::Relaxed),
            Err(err) => {
                self.log_rejection(&request, err);
                match err {
                    DispatchError::Domain(_) => c.domain_errors.fetch_add(1, Ordering::Relaxed),
                    DispatchError::AccessDenied(_) => c.access_denied.fetch_add(1, Ordering::Relaxed),
                    DispatchError::ConsensusTimeout(_) | DispatchError::ConsensusDivergence(_) => {
                        c.consensus_failures.fetch_add(1, Ordering::Relaxed)
                    }
                    DispatchError::Unexpected(_) => c.unexpected.fetch_add(1, Ordering::Relaxed),
                    _ => c.rejected.fetch_add(1, Ordering::Relaxed),
                }
            }
        };
        result
    }

    fn log_rejection(&self, request: &RequestEnvelope, err: &DispatchError) {
        let (player, command, code) = (&request.player, request.command.as_str(), err.code());
        match err {
            DispatchError::Domain(reason) => {
                info!(player = %player, command, code, %reason, "domain invariant held; nothing applied")
            }
            DispatchError::AccessDenied(reason) => {
                warn!(player = %player, command, code, %reason, "access denied")
            }
            DispatchError::ConsensusTimeout(action) | DispatchError::ConsensusDivergence(action) => {
                warn!(player = %player, command, code, action = %action, "consensus failed")
            }
            DispatchError::Unexpected(cause) => {
                error!(player = %player, command, code, %cause, "unexpected failure")
            }
            other => warn!(player = %player, command, code, reason = %other, "submission rejected"),
        }
    }

    async fn dispatch(&self, channel: Channel, request: &RequestEnvelope) -> Result<Dispatched, DispatchError> {
        let handler = self
            .registry
            .get(&request.command)
            .ok_or_else(|| DispatchError::UnknownCommand(request.command.clone()))?;
        let meta = handler.metadata;

        if channel == Channel::Player {
            self.check_session(request.player, request.session)?;
            self.check_client_version(&request.client_version)?;
        }

        let caller = Caller {
            player: request.player,
            channel,
            credentials: request.credentials.as_deref(),
        };
        let grant = self.gate.authorize(&meta, &caller)?;

        let reachable = handler
            .frame
            .and_then(|hooks| (hooks.trigger)(&request.fields).ok())
            .is_some_and(|match_id| self.frames.has_snapshot(&match_id));

        // Player submissions against the caller's own record must not go back in time
        let ordered_at = |target: PlayerId| {
            (channel == Channel::Player && target == request.player).then_some(request.timestamp_ms)
        };

        match self.router.route(&meta, handler.capabilities(), reachable)? {
            Route::Direct => {
                let command = (handler.decode)(&request.fields)?;
                let target = grant.check_target(command.target_record())?;
                self.apply(command.as_ref(), grant.level, target, ordered_at(target), None)
                    .await
            }
            Route::FrameDerived => {
                let hooks = handler
                    .frame
                    .ok_or_else(|| DispatchError::unexpected("frame route without hooks"))?;
                let derived = (hooks.derive)(&self.frames, &request.fields, request.player)?;
                match derived.derivation {
                    Derivation::NoOp(reason) => {
                        info!(player = %request.player, command = meta.type_tag, reason, "derived no-op");
                        Ok(Dispatched::NoOp { reason: reason.to_string() })
                    }
                    Derivation::Apply(command) => {
                        let target = grant.check_target(command.target_record())?;
                        self.apply(command.as_ref(), grant.level, target, ordered_at(target), Some(&derived.values))
                            .await
                    }
                }
            }
            Route::Consensus => self.resolve(handler, &grant, request).await,
        }
    }

    fn check_session(&self, player: PlayerId, session: SessionId) -> Result<(), DispatchError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| DispatchError::unexpected("session registry poisoned"))?;
        if sessions.is_current(player, session) {
            Ok(())
        } else {
            Err(DispatchError::SessionNotOpen(player))
        }
    }

    fn check_client_version(&self, raw: &str) -> Result<(), DispatchError> {
        let minimum = self.config.min_client_version;
        match raw.parse::<ClientVersion>() {
            Ok(version) if version >= minimum => Ok(()),
            _ => Err(DispatchError::OutdatedClient {
                client: raw.to_string(),
                minimum: minimum.to_string(),
            }),
        }
    }

    /// Buffers a vote; applies the agreed command to its subject on quorum.
    ///
    /// Votes target another participant's record, so the Player-level
    /// target check is replaced by roster checks on both voter and subject.
    async fn resolve(
        &self,
        handler: &CommandHandler,
        grant: &Grant,
        request: &RequestEnvelope,
    ) -> Result<Dispatched, DispatchError> {
        let decode = handler
            .consensus
            .ok_or_else(|| DispatchError::unexpected("consensus route without decoder"))?;
        let mut command = decode(&request.fields)?;
        let proof = request.proof.as_deref().ok_or(ProofError::Missing)?;
        command.attach_identity_proof(IdentityProof::from_bytes(proof)?);

        let match_id = command.match_id().clone();
        let (connected, session) = {
            let matches = self
                .matches
                .read()
                .map_err(|_| DispatchError::unexpected("match roster poisoned"))?;
            matches.check_voter(&match_id, grant.caller)?;
            matches.check_target(&match_id, command.subject())?;
            let session = matches.session(&match_id).cloned().unwrap_or_default();
            (matches.connected_count(&match_id)?, session)
        };
        let frame = self.frames.frame(&match_id).map(|f| f.frame).unwrap_or(0);
        command.attach_derived_values(&SimulationValues::from_session(
            match_id.clone(),
            &session,
            request.player,
            frame,
        ));

        let verdict = {
            let sessions = self
                .sessions
                .read()
                .map_err(|_| DispatchError::unexpected("session registry poisoned"))?;
            let mut resolver = self
                .resolver
                .lock()
                .map_err(|_| DispatchError::unexpected("consensus resolver poisoned"))?;
            resolver.submit(
                self.ctx.now(),
                &sessions,
                Submission {
                    voter: request.player,
                    command,
                    signed_fields: request.fields.clone(),
                    connected,
                },
            )?
        };

        match verdict {
            ConsensusVerdict::Pending { supporters, quorum } => {
                debug!(player = %request.player, match_id = %match_id, supporters, quorum, "vote buffered");
                Ok(Dispatched::Pending { supporters, quorum })
            }
            ConsensusVerdict::AlreadyResolved => Ok(Dispatched::NoOp {
                reason: "action already resolved".to_string(),
            }),
            ConsensusVerdict::Resolved(command) => {
                let subject = command.subject();
                let values = SimulationValues::from_session(match_id, &session, subject, frame);
                self.apply(command.as_command(), grant.level, subject, None, Some(&values))
                    .await
            }
        }
    }

    /// Runs a command against its target record inside the record's queue.
    async fn apply(
        &self,
        command: &dyn AnyCommand,
        access: AccessLevel,
        target: PlayerId,
        ordered_at: Option<u64>,
        values: Option<&SimulationValues>,
    ) -> Result<Dispatched, DispatchError> {
        let type_tag = command.metadata().type_tag;
        let _queue = self.locks.acquire(target).await?;

        let record = self
            .store
            .load(target)?
            .ok_or(DispatchError::RecordNotFound(target))?;
        if let Some(timestamp_ms) = ordered_at {
            let last_ms = record.meta.last_command_ms;
            if timestamp_ms < last_ms {
                return Err(DispatchError::OutOfOrder { timestamp_ms, last_ms });
            }
        }

        let session = SessionState::default();
        let dispatch = Dispatch {
            player: target,
            access,
            record: &record,
            session: &session,
            values,
            config: &self.game,
        };
        let applied = match execute_atomically(command, dispatch).await {
            Ok(applied) => applied,
            Err(ExecutionFailure::Domain(err)) => return Err(err.into()),
            Err(ExecutionFailure::Panicked(cause)) => {
                error!(player = %target, command = type_tag, %cause, "command panicked; nothing applied");
                return Err(DispatchError::unexpected(cause));
            }
        };

        let mut updated = applied.record;
        if let Some(timestamp_ms) = ordered_at {
            updated.meta.last_command_ms = timestamp_ms;
        }
        let digest = updated.digest();
        let changed = record.digest().diverging_sections(&digest);
        self.store.save(&updated)?;

        info!(player = %target, command = type_tag, changed = ?changed, "command applied");
        let report = self.bus.publish_all(&applied.events);
        if !report.failed.is_empty() {
            warn!(player = %target, command = type_tag, failed = ?report.failed, "subscribers failed");
        }

        Ok(Dispatched::Applied {
            target,
            digest,
            events: applied.events.iter().map(|e| e.name()).collect(),
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_fields;
    use crate::command::{CommandMetadata, ExecutionMode, GameCommand};
    use crate::commands::{
        standard_registry, CompleteMilestone, EndOfMatchRewards, ForceCorrectRecord, GrantPurchase,
        PurchaseItem, RemoveParticipant, SanitizeRecord,
    };
    use crate::consensus::ConsensusCommand;
    use crate::context::ExecutionContext;
    use crate::error::{ConsensusError, DomainError};
    use crate::events::{MatchRewardsGranted, MilestoneCompleted};
    use crate::frame::{MatchFrame, MatchPhase, PlacementResult};
    use crate::record::{Currency, Milestone};
    use crate::trust::TokenFactory;
    use async_trait::async_trait;
    use biscuit_auth::KeyPair;
    use ed25519_dalek::SigningKey;
    use serde::Deserialize;
    use statelink_env::TokioContext;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        backend: Arc<Backend<TokioContext>>,
        tokens: TokenFactory,
    }

    fn harness_with(registry: CommandRegistry, config: BackendConfig) -> Harness {
        let tokens = TokenFactory::new(KeyPair::new());
        let backend = Backend::new(TokioContext::shared(), registry, tokens.authority()).with_config(config);
        Harness {
            backend: Arc::new(backend),
            tokens,
        }
    }

    fn harness() -> Harness {
        harness_with(standard_registry(), BackendConfig::default())
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    async fn open(h: &Harness, seed: u64) -> SessionGrant {
        h.backend
            .open_session(PlayerId::from_seed(seed), Some(key(seed as u8 + 1).verifying_key().to_bytes()))
            .await
            .unwrap()
    }

    fn request<C: GameCommand>(grant: &SessionGrant, command: &C, timestamp_ms: u64) -> RequestEnvelope {
        RequestEnvelope::new(
            grant.player,
            grant.session,
            C::METADATA.type_tag,
            encode_fields(command).unwrap(),
            timestamp_ms,
        )
        .with_client_version("1.2.0")
        .with_config_version(1)
    }

    #[tokio::test]
    async fn test_open_session_sanitizes_once() {
        let h = harness();
        let migrations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&migrations);
        h.backend
            .bus()
            .subscribe::<crate::events::RecordMigrated, _>("count", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let first = open(&h, 1).await;
        let second = open(&h, 1).await;

        assert_ne!(first.session, second.session);
        assert_eq!(migrations.load(Ordering::SeqCst), 1);
        let record = PlayerRecord::from_fields(&second.state).unwrap();
        assert_eq!(record.balance(Currency::Coins), 200);
        assert_eq!(record.meta.schema_version, crate::record::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_retried_milestone_rewarded_once() {
        let h = harness();
        let grant = open(&h, 1).await;
        let published = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&published);
        h.backend.bus().subscribe::<MilestoneCompleted, _>("count", move |event| {
            assert_eq!(event.milestone, Milestone::Intro);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let command = CompleteMilestone { milestone: Milestone::Intro };
        let first = h.backend.submit(Channel::Player, request(&grant, &command, 10)).await.unwrap();
        assert!(matches!(first, Dispatched::Applied { .. }));

        // The ack was lost; the client retries the identical request
        let retry = h.backend.submit(Channel::Player, request(&grant, &command, 10)).await;
        assert!(matches!(retry, Err(DispatchError::Domain(DomainError::AlreadyCompleted(_)))));

        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.record(grant.player).unwrap().balance(Currency::Coins), 300);
        assert_eq!(h.backend.stats().domain_errors, 1);
    }

    #[tokio::test]
    async fn test_admin_command_from_player_invokes_nothing() {
        let h = harness();
        let grant = open(&h, 1).await;
        let before = h.backend.record(grant.player).unwrap();

        let command = ForceCorrectRecord {
            target: grant.player,
            section: "currencies".into(),
            value: r#"{"gems":99999}"#.into(),
        };
        let response = h.backend.respond(Channel::Player, request(&grant, &command, 10)).await;

        assert_eq!(response.status, ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("access_denied"));
        assert_eq!(h.backend.record(grant.player).unwrap(), before);
        assert_eq!(h.backend.stats().access_denied, 1);
    }

    #[tokio::test]
    async fn test_admin_credential_corrects_other_record() {
        let h = harness();
        let admin = open(&h, 1).await;
        let victim = open(&h, 2).await;
        let token = h.tokens.create_admin_token().unwrap();

        let command = ForceCorrectRecord {
            target: victim.player,
            section: "currencies".into(),
            value: r#"{"coins":5}"#.into(),
        };
        let outcome = h
            .backend
            .submit(Channel::Player, request(&admin, &command, 10).with_credentials(token))
            .await
            .unwrap();

        match outcome {
            Dispatched::Applied { target, changed, .. } => {
                assert_eq!(target, victim.player);
                assert_eq!(changed, vec!["currencies".to_string()]);
            }
            other => panic!("expected applied, got {:?}", other),
        }
        assert_eq!(h.backend.record(victim.player).unwrap().balance(Currency::Coins), 5);
    }

    #[tokio::test]
    async fn test_service_command_needs_internal_channel() {
        let h = harness();
        let grant = open(&h, 1).await;
        let token = h.tokens.create_service_token("grant_").unwrap();
        let command = GrantPurchase { product: "gem_pack_small".into(), receipt: "r-9".into() };

        let player_channel = h
            .backend
            .submit(Channel::Player, request(&grant, &command, 10).with_credentials(token.clone()))
            .await;
        assert_eq!(player_channel.unwrap_err().code(), "access_denied");

        let internal = RequestEnvelope::new(grant.player, SessionId::default(), "grant_purchase", encode_fields(&command).unwrap(), 0)
            .with_credentials(token);
        assert!(h.backend.submit(Channel::Internal, internal).await.is_ok());
        assert_eq!(h.backend.record(grant.player).unwrap().balance(Currency::Gems), 50);
    }

    #[tokio::test]
    async fn test_old_receipt_stays_consumed() {
        let h = harness();
        let grant = open(&h, 1).await;
        let token = h.tokens.create_service_token("grant_").unwrap();
        let validated = |receipt: String| {
            let command = GrantPurchase { product: "gem_pack_small".into(), receipt };
            RequestEnvelope::new(grant.player, SessionId::default(), "grant_purchase", encode_fields(&command).unwrap(), 0)
                .with_credentials(token.clone())
        };

        for i in 0..=100 {
            h.backend.submit(Channel::Internal, validated(format!("r-{}", i))).await.unwrap();
        }
        let before = h.backend.record(grant.player).unwrap().balance(Currency::Gems);
        assert_eq!(before, 50 * 101);

        // The validator retries the very first receipt long after it was used
        let replay = h.backend.submit(Channel::Internal, validated("r-0".into())).await;
        assert_eq!(replay, Err(DispatchError::Domain(DomainError::ReceiptConsumed("r-0".into()))));
        assert_eq!(h.backend.record(grant.player).unwrap().balance(Currency::Gems), before);
    }

    #[tokio::test]
    async fn test_initialization_commands_cannot_be_submitted() {
        let h = harness();
        let grant = open(&h, 1).await;
        let err = h
            .backend
            .submit(Channel::Internal, request(&grant, &SanitizeRecord {}, 10).with_credentials(h.tokens.create_admin_token().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "initialization_only");
    }

    #[tokio::test]
    async fn test_stale_session_and_old_client_rejected() {
        let h = harness_with(
            standard_registry(),
            BackendConfig::default().with_min_client_version(ClientVersion::new(1, 1, 0)),
        );
        let old = open(&h, 1).await;
        let current = open(&h, 1).await;
        let command = CompleteMilestone { milestone: Milestone::Intro };

        let err = h.backend.submit(Channel::Player, request(&old, &command, 10)).await.unwrap_err();
        assert_eq!(err, DispatchError::SessionNotOpen(old.player));

        let outdated = request(&current, &command, 10).with_client_version("1.0.9");
        let err = h.backend.submit(Channel::Player, outdated).await.unwrap_err();
        assert_eq!(err.code(), "outdated_client");
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let h = harness();
        let grant = open(&h, 1).await;

        let later = CompleteMilestone { milestone: Milestone::Loadout };
        h.backend.submit(Channel::Player, request(&grant, &later, 200)).await.unwrap();

        let earlier = CompleteMilestone { milestone: Milestone::Intro };
        let err = h.backend.submit(Channel::Player, request(&grant, &earlier, 100)).await.unwrap_err();
        assert_eq!(err, DispatchError::OutOfOrder { timestamp_ms: 100, last_ms: 200 });
    }

    #[tokio::test]
    async fn test_config_version_hint() {
        let h = harness_with(standard_registry(), BackendConfig::default().with_config_version(4));
        let grant = open(&h, 1).await;
        let command = CompleteMilestone { milestone: Milestone::Intro };

        let response = h.backend.respond(Channel::Player, request(&grant, &command, 10)).await;
        assert_eq!(response.config_version, Some(4));
        assert!(!StateDigest::read_from(&response.fields).is_empty());
    }

    // ------------------------------------------------------------------------
    // Record queues
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_purchases_on_one_record_serialize() {
        let h = harness();
        let grant = open(&h, 1).await;
        let intro = CompleteMilestone { milestone: Milestone::Intro };
        h.backend.submit(Channel::Player, request(&grant, &intro, 10)).await.unwrap();
        assert_eq!(h.backend.record(grant.player).unwrap().balance(Currency::Coins), 300);

        // Both purchases park on the record queue before either runs
        let held = h.backend.locks.acquire(grant.player).await.unwrap();
        let buy = PurchaseItem { item: "blaster".into() };
        let release = async move {
            tokio::task::yield_now().await;
            drop(held);
        };
        let (first, second, ()) = tokio::join!(
            h.backend.submit(Channel::Player, request(&grant, &buy, 20)),
            h.backend.submit(Channel::Player, request(&grant, &buy, 20)),
            release,
        );

        let outcomes = [first, second];
        let applied = outcomes.iter().filter(|o| matches!(o, Ok(Dispatched::Applied { .. }))).count();
        let refused = outcomes
            .iter()
            .filter(|o| matches!(o, Err(DispatchError::Domain(_))))
            .count();
        assert_eq!((applied, refused), (1, 1));

        let record = h.backend.record(grant.player).unwrap();
        assert_eq!(record.balance(Currency::Coins), 0);
        assert!(record.equipment.owned.contains("blaster"));
    }

    #[tokio::test]
    async fn test_busy_record_does_not_block_others() {
        let h = harness();
        let busy = open(&h, 1).await;
        let other = open(&h, 2).await;
        let intro = CompleteMilestone { milestone: Milestone::Intro };

        let held = h.backend.locks.acquire(busy.player).await.unwrap();

        let free = tokio::time::timeout(
            Duration::from_secs(1),
            h.backend.submit(Channel::Player, request(&other, &intro, 10)),
        )
        .await;
        assert!(matches!(free, Ok(Ok(Dispatched::Applied { .. }))));

        let waiting = tokio::time::timeout(
            Duration::from_millis(20),
            h.backend.submit(Channel::Player, request(&busy, &intro, 10)),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(h.backend.record(busy.player).unwrap().balance(Currency::Coins), 200);

        drop(held);
        assert!(h.backend.submit(Channel::Player, request(&busy, &intro, 10)).await.is_ok());
        assert_eq!(h.backend.record(busy.player).unwrap().balance(Currency::Coins), 300);
    }

    // ------------------------------------------------------------------------
    // Panics
    // ------------------------------------------------------------------------

    #[derive(Debug, Serialize, Deserialize)]
    struct Explode {}

    #[async_trait]
    impl GameCommand for Explode {
        const METADATA: CommandMetadata =
            CommandMetadata::new("explode", AccessLevel::Player, ExecutionMode::ServerAuthoritative);

        async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
            ctx.logic().currency().credit(Currency::Gems, 500);
            let table: Vec<u64> = Vec::new();
            let _ = table[3];
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_command_is_isolated() {
        let registry = CommandRegistry::builder()
            .initialization::<SanitizeRecord>()
            .command::<Explode>()
            .command::<CompleteMilestone>()
            .build();
        let h = harness_with(registry, BackendConfig::default());
        let grant = open(&h, 1).await;

        let response = h.backend.respond(Channel::Player, request(&grant, &Explode {}, 10)).await;
        assert_eq!(response.error_code.as_deref(), Some("unexpected"));
        assert_eq!(response.message.as_deref(), Some("internal error"));
        assert_eq!(h.backend.record(grant.player).unwrap().balance(Currency::Gems), 0);

        // The record queue keeps working
        let command = CompleteMilestone { milestone: Milestone::Intro };
        assert!(h.backend.submit(Channel::Player, request(&grant, &command, 11)).await.is_ok());
    }

    // ------------------------------------------------------------------------
    // Frame derivation
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Snapshots(RwLock<HashMap<MatchId, MatchFrame>>);

    impl SnapshotSource for Snapshots {
        fn match_results(&self, match_id: &MatchId) -> Option<MatchFrame> {
            self.0.read().unwrap().get(match_id).cloned()
        }
    }

    fn four_player_frame() -> MatchFrame {
        MatchFrame {
            match_id: MatchId::new("m-b"),
            frame: 3600,
            phase: MatchPhase::Ended,
            session: GameSession { ranked: true, ..GameSession::default() },
            results: (0..4)
                .map(|i| PlacementResult {
                    player: PlayerId::from_seed(i),
                    placement: 4 - i as u32,
                    kills: i as u32,
                    damage: 100 * i as u32,
                    quit: false,
                })
                .collect(),
        }
    }

    async fn settle_in_order(order: &[u64]) -> Vec<PlayerRecord> {
        let snapshots = Arc::new(Snapshots::default());
        let frame = four_player_frame();
        snapshots.0.write().unwrap().insert(frame.match_id.clone(), frame.clone());

        let tokens = TokenFactory::new(KeyPair::new());
        let backend = Backend::new(TokioContext::shared(), standard_registry(), tokens.authority())
            .with_snapshot_source(snapshots);
        let h = Harness { backend: Arc::new(backend), tokens };

        let mut grants = HashMap::new();
        for seed in 0..4 {
            grants.insert(seed, open(&h, seed).await);
        }
        for seed in order {
            let grant = &grants[seed];
            // Each client claims first place with 50 kills
            let forged = EndOfMatchRewards {
                match_id: frame.match_id.clone(),
                player: grant.player,
                placement: 1,
                kills: 50,
                ranked: true,
            };
            let outcome = h.backend.submit(Channel::Player, request(grant, &forged, 10)).await.unwrap();
            assert!(matches!(outcome, Dispatched::Applied { .. }));
        }
        (0..4).map(|seed| h.backend.record(PlayerId::from_seed(seed)).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_match_rewards_ignore_submissions_and_order() {
        let forward = settle_in_order(&[0, 1, 2, 3]).await;
        let reverse = settle_in_order(&[3, 1, 0, 2]).await;

        for (a, b) in forward.iter().zip(&reverse) {
            assert_eq!(a.rewards, b.rewards);
            assert_eq!(a.profile, b.profile);
        }
        // Seed 3 placed first with 3 kills: 120 + 30
        assert_eq!(forward[3].rewards[0].amount, 150);
        // Seed 0 placed fourth with no kills
        assert_eq!(forward[0].rewards[0].amount, 30);
        assert_eq!(forward[0].profile.trophies, 0);
    }

    #[tokio::test]
    async fn test_frame_noop_and_missing_snapshot() {
        let snapshots = Arc::new(Snapshots::default());
        let mut frame = four_player_frame();
        frame.phase = MatchPhase::Running;
        snapshots.0.write().unwrap().insert(frame.match_id.clone(), frame.clone());

        let tokens = TokenFactory::new(KeyPair::new());
        let backend = Backend::new(TokioContext::shared(), standard_registry(), tokens.authority())
            .with_snapshot_source(snapshots);
        let h = Harness { backend: Arc::new(backend), tokens };
        let grant = open(&h, 0).await;
        let granted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&granted);
        h.backend.bus().subscribe::<MatchRewardsGranted, _>("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let trigger = EndOfMatchRewards::trigger_for(frame.match_id.clone(), grant.player);
        let outcome = h.backend.submit(Channel::Player, request(&grant, &trigger, 10)).await.unwrap();
        assert_eq!(outcome, Dispatched::NoOp { reason: "match has not ended".into() });

        // Unknown match: no snapshot and no consensus capability
        let unknown = EndOfMatchRewards::trigger_for(MatchId::new("elsewhere"), grant.player);
        let err = h.backend.submit(Channel::Player, request(&grant, &unknown, 10)).await.unwrap_err();
        assert_eq!(err.code(), "no_trusted_source");
        assert_eq!(granted.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------------
    // Consensus
    // ------------------------------------------------------------------------

    fn vote(grant: &SessionGrant, seed: u64, target: PlayerId, reason: &str) -> RequestEnvelope {
        let command = RemoveParticipant::new(MatchId::new("m-k"), target, reason);
        let fields = encode_fields(&command).unwrap();
        let proof = IdentityProof::sign(&key(seed as u8 + 1), grant.player, grant.session, &command.action_id(), &fields);
        request(grant, &command, 10).with_proof(proof.to_bytes())
    }

    #[tokio::test]
    async fn test_kick_vote_resolves_exactly_once() {
        let h = harness();
        let grants: Vec<_> = futures::future::join_all((0..4).map(|s| open(&h, s))).await;
        let target = grants[3].player;
        h.backend
            .register_match(MatchId::new("m-k"), grants.iter().map(|g| g.player), GameSession::default())
            .unwrap();
        h.backend.set_connected(&MatchId::new("m-k"), target, false).unwrap();

        // Three connected voters: quorum 2
        let first = h.backend.submit(Channel::Player, vote(&grants[0], 0, target, "afk")).await.unwrap();
        assert_eq!(first, Dispatched::Pending { supporters: 1, quorum: 2 });

        let second = h.backend.submit(Channel::Player, vote(&grants[1], 1, target, "afk")).await.unwrap();
        match second {
            Dispatched::Applied { target: applied_to, .. } => assert_eq!(applied_to, target),
            other => panic!("expected applied, got {:?}", other),
        }

        let third = h.backend.submit(Channel::Player, vote(&grants[2], 2, target, "afk")).await.unwrap();
        assert!(matches!(third, Dispatched::NoOp { .. }));

        let record = h.backend.record(target).unwrap();
        assert_eq!(record.history.removals.len(), 1);
        assert_eq!(h.backend.pending_consensus(), 0);
    }

    #[tokio::test]
    async fn test_divergent_votes_apply_nothing() {
        let h = harness_with(
            standard_registry(),
            BackendConfig::default().with_consensus(
                crate::config::ConsensusConfig::default().with_quorum(crate::config::QuorumPolicy::AllConnected),
            ),
        );
        let grants: Vec<_> = futures::future::join_all((0..3).map(|s| open(&h, s))).await;
        let target = grants[2].player;
        h.backend
            .register_match(MatchId::new("m-k"), grants.iter().map(|g| g.player), GameSession::default())
            .unwrap();

        h.backend.submit(Channel::Player, vote(&grants[0], 0, target, "afk")).await.unwrap();
        let err = h
            .backend
            .submit(Channel::Player, vote(&grants[1], 1, target, "cheating"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "consensus_divergence");
        assert_eq!(h.backend.stats().consensus_failures, 1);
    }

    #[tokio::test]
    async fn test_vote_cannot_remove_player_outside_match() {
        let h = harness();
        let grants: Vec<_> = futures::future::join_all((0..4).map(|s| open(&h, s))).await;
        let bystander = grants[3].player;
        h.backend
            .register_match(MatchId::new("m-k"), grants[..3].iter().map(|g| g.player), GameSession::default())
            .unwrap();
        let trophies = h.backend.record(bystander).unwrap().profile.trophies;

        for (seed, voter) in grants[..2].iter().enumerate() {
            let err = h
                .backend
                .submit(Channel::Player, vote(voter, seed as u64, bystander, "afk"))
                .await
                .unwrap_err();
            assert_eq!(
                err,
                DispatchError::Consensus(ConsensusError::TargetNotInMatch {
                    player: bystander,
                    match_id: MatchId::new("m-k"),
                })
            );
        }

        let record = h.backend.record(bystander).unwrap();
        assert!(record.history.removals.is_empty());
        assert_eq!(record.profile.trophies, trophies);
        assert_eq!(h.backend.pending_consensus(), 0);
    }

    #[tokio::test]
    async fn test_vote_requires_roster_and_proof() {
        let h = harness();
        let voter = open(&h, 0).await;
        let outsider = open(&h, 5).await;
        h.backend
            .register_match(MatchId::new("m-k"), [voter.player], GameSession::default())
            .unwrap();

        let err = h
            .backend
            .submit(Channel::Player, vote(&outsider, 5, voter.player, "afk"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "consensus_rejected");

        let unsigned = request(&voter, &RemoveParticipant::new(MatchId::new("m-k"), outsider.player, "afk"), 10);
        let err = h.backend.submit(Channel::Player, unsigned).await.unwrap_err();
        assert_eq!(err, DispatchError::Proof(ProofError::Missing));
    }

    #[tokio::test]
    async fn test_sweeper_fails_expired_votes() {
        let h = harness_with(
            standard_registry(),
            BackendConfig::default().with_consensus(crate::config::ConsensusConfig::default().with_window_ms(0)),
        );
        let grants: Vec<_> = futures::future::join_all((0..3).map(|s| open(&h, s))).await;
        h.backend
            .register_match(MatchId::new("m-k"), grants.iter().map(|g| g.player), GameSession::default())
            .unwrap();

        let outcome = h
            .backend
            .submit(Channel::Player, vote(&grants[0], 0, grants[2].player, "afk"))
            .await
            .unwrap();
        assert!(matches!(outcome, Dispatched::Pending { .. }));
        assert_eq!(h.backend.sweep_consensus().len(), 1);
        assert_eq!(h.backend.pending_consensus(), 0);
    }
}
