//! Scenario runner - executes replication scenarios against a SimWorld.
//!
//! Every scenario builds a fresh world from the runner's seed, drives its
//! clients through the simulated network and checks the authoritative
//! records afterwards. A run is single-threaded, so the same seed always
//! produces the same timeline.

use crate::exporter::{RecordSummary, SimExport};
use crate::network::NetworkStats;
use crate::oracle::MatchOracle;
use crate::scenarios::ScenarioId;
use crate::world::{SimClient, SimConfig, SimError, SimWorld};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use statelink_core::codec::encode_fields;
use statelink_core::commands::{
    CompleteMilestone, EndOfMatchRewards, ForceCorrectRecord, GrantPurchase, PurchaseItem,
    RemoveParticipant, UnlockAllMilestones,
};
use statelink_core::events::{MatchRewardsGranted, MilestoneCompleted, ParticipantRemoved, RecordCorrected};
use statelink_core::record::{Currency, Milestone};
use statelink_core::{
    BackendConfig, BackendStats, ClientConfig, ClientStats, ConsensusCommand, DispatchError,
    GameCommand, GameConfig, GameSession, IdentityProof, LocalOutcome, MatchFrame, OutcomeBus,
    OutcomeEvent,
};
use statelink_env::{
    BackendTransport, FaultInjector, MatchId, PlayerId, RequestEnvelope, ResponseStatus,
    StatelinkContext,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Assertions that held before the run ended
    pub checks: u32,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioMetrics {
    /// Backend outcome counters
    pub backend: BackendStats,

    /// Client counters, summed over every connected client
    pub clients: ClientStats,

    /// Traffic through the simulated network
    pub network: NetworkStats,
}

/// Runs replication scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of match participants
    participants: usize,

    backend: BackendConfig,

    client: ClientConfig,

    /// Frame budget per match
    max_frames: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, participants: usize) -> Self {
        Self {
            seed,
            participants,
            backend: BackendConfig::default(),
            client: ClientConfig::default(),
            max_frames: 10_000,
        }
    }

    /// Sets the backend configuration every world starts with.
    pub fn with_backend_config(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    /// Sets the frame budget of one match.
    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = frames;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_export(scenario).0
    }

    /// Runs a scenario and returns the result with its full timeline.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let reason = format!("failed to build runtime: {}", e);
                let mut export = SimExport::new(scenario.name(), self.seed);
                export.finalize(false, Some(reason.clone()), ScenarioMetrics::default());
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    final_time_secs: 0.0,
                    checks: 0,
                    failure_reason: Some(reason),
                    metrics: ScenarioMetrics::default(),
                };
                return (result, export);
            }
        };

        runtime.block_on(self.execute(scenario))
    }

    async fn execute(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let config = SimConfig {
            seed: self.seed,
            participants: self.participants.max(minimum_participants(scenario)),
            backend: self.backend.clone(),
            client: self.client.clone(),
            max_frames: self.max_frames,
        };
        let mut run = Run::new(SimWorld::new(config), SimExport::new(scenario.name(), self.seed));

        let outcome = match scenario {
            ScenarioId::MilestoneRetry => run.milestone_retry().await,
            ScenarioId::MatchSettlement => run.match_settlement().await,
            ScenarioId::KickVote => run.kick_vote().await,
            ScenarioId::SplitVote => run.split_vote().await,
            ScenarioId::VoteTimeout => run.vote_timeout().await,
            ScenarioId::StaleProof => run.stale_proof().await,
            ScenarioId::AccessEscalation => run.access_escalation().await,
            ScenarioId::DesyncedReplica => run.desynced_replica().await,
        };

        run.finish(scenario, self.seed, outcome).await
    }
}

/// Votes need a target plus at least two connected voters.
fn minimum_participants(scenario: ScenarioId) -> usize {
    match scenario {
        ScenarioId::MilestoneRetry | ScenarioId::MatchSettlement | ScenarioId::DesyncedReplica => 1,
        ScenarioId::AccessEscalation => 2,
        ScenarioId::KickVote | ScenarioId::SplitVote | ScenarioId::VoteTimeout | ScenarioId::StaleProof => 3,
    }
}

/// Counts every published event of type `E`.
fn count_events<E: OutcomeEvent>(bus: &OutcomeBus, label: &str) -> Arc<AtomicU64> {
    let counter = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&counter);
    bus.subscribe::<E, _>(label, move |_: &E| {
        seen.fetch_add(1, Ordering::Relaxed);
    });
    counter
}

fn total(stats: impl IntoIterator<Item = ClientStats>) -> ClientStats {
    stats.into_iter().fold(ClientStats::default(), |mut sum, s| {
        sum.submitted += s.submitted;
        sum.applied += s.applied;
        sum.noops += s.noops;
        sum.pending += s.pending;
        sum.rejected += s.rejected;
        sum.retries += s.retries;
        sum.transport_failures += s.transport_failures;
        sum.resyncs += s.resyncs;
        sum
    })
}

/// Rewards the trusted frame entitles `player` to: queued coins and the
/// trophy count of a fresh record. `None` for quitters.
fn expected_rewards(game: &GameConfig, frame: &MatchFrame, player: PlayerId) -> Option<(u64, u32)> {
    let result = frame.result_for(player)?;
    if result.quit {
        return None;
    }
    let index = result.placement.saturating_sub(1) as usize;
    let coins = game.placement_coins.get(index).copied().unwrap_or(0)
        + u64::from(result.kills) * game.coins_per_kill;
    let trophies = if frame.session.ranked {
        game.ranked_trophies
            .get(index)
            .or_else(|| game.ranked_trophies.last())
            .copied()
            .unwrap_or(0)
            .max(0) as u32
    } else {
        0
    };
    Some((coins, trophies))
}

// ============================================================================
// RUN STATE
// ============================================================================

struct Run {
    world: SimWorld,
    clients: Vec<SimClient>,
    export: SimExport,
    checks: u32,
}

impl Run {
    fn new(world: SimWorld, export: SimExport) -> Self {
        Self {
            world,
            clients: Vec::new(),
            export,
            checks: 0,
        }
    }

    fn time_ms(&self) -> u64 {
        self.world.context.now().as_millis() as u64
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        let time_ms = self.time_ms();
        self.export.note(time_ms, message, None);
    }

    fn check(&mut self, condition: bool, what: impl Into<String>) -> Result<(), SimError> {
        if condition {
            self.checks += 1;
            Ok(())
        } else {
            Err(SimError::check(what))
        }
    }

    fn players(&self) -> Vec<PlayerId> {
        self.clients.iter().map(|c| c.player()).collect()
    }

    fn match_id(&self, prefix: &str) -> MatchId {
        MatchId::new(format!("{}-{}", prefix, self.world.config.seed))
    }

    /// Envelope for a submission that bypasses the client library.
    fn raw_request(&self, index: usize, command: &str, fields: statelink_env::FieldBag) -> RequestEnvelope {
        let client = &self.clients[index];
        RequestEnvelope::new(
            client.player(),
            client.session(),
            command,
            fields,
            self.world.context.unix_millis(),
        )
        .with_client_version(client.client_version().to_string())
        .with_config_version(self.world.config.client.config_version)
    }

    async fn finish(
        mut self,
        scenario: ScenarioId,
        seed: u64,
        outcome: Result<(), SimError>,
    ) -> (ScenarioResult, SimExport) {
        let mut summaries = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            if let Ok(record) = self.world.backend.record(client.player()) {
                let converged = client.record().await.digest() == record.digest();
                summaries.push(RecordSummary::new(&record, Some(converged)));
            }
        }
        for summary in summaries {
            self.export.add_record(summary);
        }

        let metrics = ScenarioMetrics {
            backend: self.world.backend.stats(),
            clients: total(self.clients.iter().map(|c| c.stats())),
            network: self.world.network.stats(),
        };

        let failure_reason = outcome.err().map(|e| e.to_string());
        let passed = failure_reason.is_none();
        let time_ms = self.time_ms();
        match &failure_reason {
            Some(reason) => {
                warn!("{} failed: {}", scenario.name(), reason);
                self.export.note(time_ms, reason.clone(), Some("error"));
            }
            None => info!("{} passed after {} checks", scenario.name(), self.checks),
        }
        self.export.finalize(passed, failure_reason.clone(), metrics);

        let result = ScenarioResult {
            scenario,
            seed,
            passed,
            final_time_secs: self.world.time(),
            checks: self.checks,
            failure_reason,
            metrics,
        };
        (result, self.export)
    }

    // ========================================================================
    // DST-001: MILESTONE RETRY
    // ========================================================================

    /// The ack of a milestone is lost and the client retries it; the next
    /// purchase is dropped once on the way in.
    async fn milestone_retry(&mut self) -> Result<(), SimError> {
        info!("DST-001: MilestoneRetry - lost ack, retried milestone");
        let game = GameConfig::default();
        let completed = count_events::<MilestoneCompleted>(&self.world.backend.bus(), "milestone-audit");

        let client = self.world.connect(0).await?;
        let player = client.player();
        self.clients.push(client);

        self.world.network.drop_acks(player, 1);
        let outcome = self.clients[0]
            .execute(&CompleteMilestone { milestone: Milestone::Intro })
            .await?;
        self.check(
            matches!(outcome, LocalOutcome::Applied { .. }),
            format!("milestone applied locally, got {:?}", outcome),
        )?;

        let intro = game.milestone_rewards.get(&Milestone::Intro).copied().unwrap_or(0);
        let optimistic = self.clients[0].record().await.balance(Currency::Coins);
        self.check(
            optimistic == game.starter_coins + intro,
            format!("optimistic balance {} after milestone", optimistic),
        )?;
        self.note("milestone applied locally; its ack will be lost");

        self.world.network.drop_requests(player, 1);
        self.clients[0].execute(&PurchaseItem { item: "wave".into() }).await?;
        self.note("purchase queued; its first request will be dropped");

        self.clients[0].settle().await;
        self.note("queue settled");

        let price = game.catalog.get("wave").map(|item| item.price).unwrap_or(0);
        let expected = game.starter_coins + intro - price;
        let coins = self.world.backend.record(player)?.balance(Currency::Coins);
        self.check(coins == expected, format!("backend holds {} coins, expected {}", coins, expected))?;

        let fired = completed.load(Ordering::Relaxed);
        self.check(fired == 1, format!("milestone event fired {} times", fired))?;

        let domain_errors = self.world.backend.stats().domain_errors;
        self.check(
            domain_errors == 1,
            format!("{} retries rejected as already completed", domain_errors),
        )?;

        let stats = self.clients[0].stats();
        self.check(stats.retries == 2, format!("client retried {} times", stats.retries))?;

        let converged = self.world.converged(&self.clients).await?;
        self.check(converged, "client cache converged with the backend")
    }

    // ========================================================================
    // DST-002: MATCH SETTLEMENT
    // ========================================================================

    /// Every client first forges a first-place claim, then settles honestly
    /// from its own replica.
    async fn match_settlement(&mut self) -> Result<(), SimError> {
        info!("DST-002: MatchSettlement - forged claims against the trusted frame");
        let game = GameConfig::default();
        let granted = count_events::<MatchRewardsGranted>(&self.world.backend.bus(), "rewards-audit");

        self.clients = self.world.connect_all().await?;
        let players = self.players();
        let match_id = self.match_id("ranked");
        let session = GameSession {
            ranked: true,
            ..GameSession::default()
        };
        let mut authority = self.world.start_match(match_id.clone(), session)?;

        let mut quitters = Vec::new();
        if players.len() >= 3 {
            let quitter = players[players.len() - 1];
            authority.quit(quitter);
            quitters.push(quitter);
            self.note(format!("{} quit before the first frame", quitter));
        }

        let mut replicas: Vec<MatchOracle> = players.iter().map(|_| authority.clone()).collect();
        let frames = self.world.finish_match(&mut authority);
        for replica in &mut replicas {
            replica.run_to_end(self.world.config.max_frames);
        }
        let trusted = authority.snapshot();
        self.note(format!("{} ended after {} frames", match_id, frames));

        for replica in &replicas {
            let agrees = replica.snapshot() == trusted;
            self.check(agrees, "replica derived the authority's final frame")?;
        }

        // Forged claims, sent in a seeded order
        let mut order: Vec<usize> = (0..players.len()).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.world.context.next_u64()));
        for index in order {
            let player = players[index];
            let forged = EndOfMatchRewards {
                match_id: match_id.clone(),
                player,
                placement: 1,
                kills: 50,
                ranked: true,
            };
            let fields = encode_fields(&forged).map_err(DispatchError::from)?;
            let request = self.raw_request(index, EndOfMatchRewards::METADATA.type_tag, fields);
            let response = self.world.transport(index).submit(request).await?;

            let expected = if quitters.contains(&player) {
                ResponseStatus::NoOp
            } else {
                ResponseStatus::Applied
            };
            self.check(
                response.status == expected,
                format!("forged claim from {} answered {:?}", player, response.status),
            )?;
            self.note(format!("forged claim from {} answered {:?}", player, response.status));
        }

        // Honest settlement from each replica
        for (index, replica) in replicas.iter().enumerate() {
            let outcome = self.clients[index]
                .execute_from_frame::<EndOfMatchRewards>(&replica.snapshot())
                .await?;
            let quit = quitters.contains(&players[index]);
            self.check(
                matches!(outcome, LocalOutcome::NoOp(_)) == quit,
                format!("local settlement for {} was {:?}", players[index], outcome),
            )?;
        }
        self.world.settle(&self.clients).await;
        self.note("every client settled");

        for &player in &players {
            let record = self.world.backend.record(player)?;
            let pending: u64 = record.rewards.iter().map(|r| r.amount).sum();
            let (coins, trophies) = expected_rewards(&game, &trusted, player).unwrap_or((0, 0));
            self.check(
                pending == coins,
                format!("{} has {} pending coins, trusted frame grants {}", player, pending, coins),
            )?;
            self.check(
                record.profile.trophies == trophies,
                format!("{} has {} trophies, expected {}", player, record.profile.trophies, trophies),
            )?;
        }

        let winners = (players.len() - quitters.len()) as u64;
        let fired = granted.load(Ordering::Relaxed);
        self.check(fired == winners, format!("rewards granted {} times for {} players", fired, winners))?;

        let converged = self.world.converged(&self.clients).await?;
        self.check(converged, "every cache converged after settlement")
    }

    // ========================================================================
    // DST-003..005: CONSENSUS
    // ========================================================================

    /// Registers a match and disconnects its last participant.
    fn start_vote_match(&mut self, prefix: &str) -> Result<(MatchId, PlayerId), SimError> {
        let match_id = self.match_id(prefix);
        self.world.start_match(match_id.clone(), GameSession::default())?;
        let target = self.world.player(self.world.config.participants - 1);
        self.world.backend.set_connected(&match_id, target, false)?;
        self.note(format!("{} disconnected from {}", target, match_id));
        Ok((match_id, target))
    }

    async fn kick_vote(&mut self) -> Result<(), SimError> {
        info!("DST-003: KickVote - quorum of connected participants");
        let removed = count_events::<ParticipantRemoved>(&self.world.backend.bus(), "removal-audit");

        self.clients = self.world.connect_all().await?;
        let (match_id, target) = self.start_vote_match("kick")?;
        let voters = self.clients.len() - 1;
        let quorum = self.world.config.backend.consensus.quorum.required(voters);

        let vote = RemoveParticipant::new(match_id, target, "afk");
        for client in &self.clients[..voters] {
            client.submit_vote(&vote).await?;
            client.settle().await;
        }
        self.note(format!("{} voters submitted, quorum {}", voters, quorum));

        // The disconnected target is not a voter
        self.clients[voters].submit_vote(&vote).await?;
        self.clients[voters].settle().await;

        let record = self.world.backend.record(target)?;
        self.check(
            record.history.removals.len() == 1,
            format!("target removed {} times", record.history.removals.len()),
        )?;
        let fired = removed.load(Ordering::Relaxed);
        self.check(fired == 1, format!("removal event fired {} times", fired))?;
        self.check(self.world.backend.pending_consensus() == 0, "no vote left pending")?;

        let stats = total(self.clients.iter().map(|c| c.stats()));
        self.check(
            stats.pending == quorum.saturating_sub(1) as u64,
            format!("{} votes buffered before quorum {}", stats.pending, quorum),
        )?;
        self.check(stats.applied == 1, format!("removal applied {} times", stats.applied))?;
        self.check(
            stats.noops == voters.saturating_sub(quorum) as u64,
            format!("{} late votes answered no-op", stats.noops),
        )?;
        self.check(stats.rejected == 1, "target's own vote rejected")
    }

    /// Each voter gives a different reason, so no group can reach quorum.
    async fn split_vote(&mut self) -> Result<(), SimError> {
        info!("DST-004: SplitVote - structurally different votes");
        let removed = count_events::<ParticipantRemoved>(&self.world.backend.bus(), "removal-audit");

        self.clients = self.world.connect_all().await?;
        let (match_id, target) = self.start_vote_match("split")?;
        let voters = self.clients.len() - 1;
        let quorum = self.world.config.backend.consensus.quorum.required(voters);
        self.check(quorum >= 2, format!("quorum {} cannot split", quorum))?;

        for (index, client) in self.clients[..voters].iter().enumerate() {
            let vote = RemoveParticipant::new(match_id.clone(), target, format!("reason-{}", index));
            client.submit_vote(&vote).await?;
            client.settle().await;
        }
        self.note(format!("{} voters disagreed", voters));

        let record = self.world.backend.record(target)?;
        self.check(record.history.removals.is_empty(), "split vote removed nobody")?;
        self.check(removed.load(Ordering::Relaxed) == 0, "no removal event")?;

        let backend = self.world.backend.stats();
        self.check(
            backend.consensus_failures == 1,
            format!("{} consensus failures", backend.consensus_failures),
        )?;
        self.check(self.world.backend.pending_consensus() == 0, "diverged action no longer pending")?;

        let stats = total(self.clients.iter().map(|c| c.stats()));
        self.check(stats.applied == 0, "nothing applied")?;
        self.check(stats.rejected >= 1, "diverging vote rejected")
    }

    /// One vote expires lazily on the next submission, another through the
    /// sweep.
    async fn vote_timeout(&mut self) -> Result<(), SimError> {
        info!("DST-005: VoteTimeout - window elapses before quorum");
        self.clients = self.world.connect_all().await?;
        let participants = self.clients.len();
        let quorum = self.world.config.backend.consensus.quorum.required(participants);
        self.check(quorum >= 2, format!("quorum {} resolves a lone vote", quorum))?;

        let match_id = self.match_id("timeout");
        self.world.start_match(match_id.clone(), GameSession::default())?;
        let first = self.world.player(participants - 1);
        let second = self.world.player(participants - 2);
        let past_window = self.world.config.backend.consensus.window() + Duration::from_millis(1);

        let lazy = RemoveParticipant::new(match_id.clone(), first, "afk");
        self.clients[0].submit_vote(&lazy).await?;
        self.clients[0].settle().await;
        self.world.advance(past_window);
        self.clients[1].submit_vote(&lazy).await?;
        self.clients[1].settle().await;
        self.note(format!("vote against {} arrived after the window", first));

        let swept = RemoveParticipant::new(match_id, second, "afk");
        self.clients[0].submit_vote(&swept).await?;
        self.clients[0].settle().await;
        self.world.advance(past_window);
        let expired = self.world.backend.sweep_consensus();
        self.note(format!("sweep expired {} actions", expired.len()));
        self.check(expired.len() == 1, format!("sweep expired {} actions", expired.len()))?;

        self.clients[1].submit_vote(&swept).await?;
        self.clients[1].settle().await;

        for target in [first, second] {
            let record = self.world.backend.record(target)?;
            self.check(record.history.removals.is_empty(), format!("{} was not removed", target))?;
        }
        let backend = self.world.backend.stats();
        self.check(
            backend.consensus_failures == 2,
            format!("{} consensus failures", backend.consensus_failures),
        )?;
        self.check(self.world.backend.pending_consensus() == 0, "no vote left pending")?;

        let late = self.clients[1].stats();
        self.check(late.rejected == 2, format!("{} late votes rejected", late.rejected))?;
        let early = self.clients[0].stats();
        self.check(early.pending == 2, format!("{} votes buffered", early.pending))
    }

    // ========================================================================
    // DST-006: STALE PROOF
    // ========================================================================

    async fn stale_proof(&mut self) -> Result<(), SimError> {
        info!("DST-006: StaleProof - replayed proof from a retired session");
        self.clients = self.world.connect_all().await?;
        let (match_id, target) = self.start_vote_match("stale")?;

        let voter = self.clients[0].player();
        let retired = self.clients[0].session();
        let vote = RemoveParticipant::new(match_id, target, "cheating");
        let fields = encode_fields(&vote).map_err(DispatchError::from)?;
        let (high, low) = voter.as_uuid().as_u64_pair();
        let session_key = self.world.context.derive_signing_key(high ^ low);
        let replayed = IdentityProof::sign(&session_key, voter, retired, &vote.action_id(), &fields);

        let reconnected = self.world.connect(0).await?;
        let retired_client = std::mem::replace(&mut self.clients[0], reconnected);
        self.note(format!("{} rotated session {} -> {}", voter, retired, self.clients[0].session()));

        retired_client.submit_vote(&vote).await?;
        retired_client.settle().await;
        let rejected = retired_client.stats().rejected;
        self.check(rejected == 1, "vote from the retired session rejected")?;

        let request = self
            .raw_request(0, RemoveParticipant::METADATA.type_tag, fields.clone())
            .with_proof(replayed.to_bytes());
        let response = self.world.transport(0).submit(request).await?;
        self.check(
            response.error_code.as_deref() == Some("invalid_proof"),
            format!("replayed proof answered {:?}", response.error_code),
        )?;
        self.note("replayed proof rejected");

        let forged_key = self.world.keys.forged_key(0);
        let forged = IdentityProof::sign(&forged_key, voter, self.clients[0].session(), &vote.action_id(), &fields);
        let request = self
            .raw_request(0, RemoveParticipant::METADATA.type_tag, fields)
            .with_proof(forged.to_bytes());
        let response = self.world.transport(0).submit(request).await?;
        self.check(
            response.error_code.as_deref() == Some("invalid_proof"),
            format!("unbound key answered {:?}", response.error_code),
        )?;
        self.note("proof from an unbound key rejected");

        self.check(self.world.backend.pending_consensus() == 0, "no rejected proof was buffered")?;
        let backend = self.world.backend.stats();
        self.check(backend.rejected == 3, format!("{} rejections", backend.rejected))?;

        self.clients[0].submit_vote(&vote).await?;
        self.clients[0].settle().await;
        let honest = self.clients[0].stats();
        self.check(honest.rejected == 0, "vote from the current session accepted")?;

        let record = self.world.backend.record(target)?;
        let quorum = self
            .world
            .config
            .backend
            .consensus
            .quorum
            .required(self.clients.len() - 1);
        self.check(
            record.history.removals.len() == usize::from(quorum <= 1),
            "only the honest vote counted",
        )
    }

    // ========================================================================
    // DST-007: ACCESS ESCALATION
    // ========================================================================

    async fn access_escalation(&mut self) -> Result<(), SimError> {
        info!("DST-007: AccessEscalation - player-level caller, elevated commands");
        self.check(
            !self.world.config.backend.development_mode,
            "access gate is bypassed in development mode",
        )?;
        let corrected = count_events::<RecordCorrected>(&self.world.backend.bus(), "correction-audit");

        self.clients = self.world.connect_all().await?;
        let victim = self.clients[1].player();
        let before = self.world.backend.record(victim)?.digest();
        let own = self.world.backend.record(self.clients[0].player())?.digest();

        let seize = ForceCorrectRecord {
            target: victim,
            section: "currencies".into(),
            value: r#"{"coins":999999}"#.into(),
        };
        let grant = GrantPurchase {
            product: "gem_pack_small".into(),
            receipt: format!("forged-{}", self.world.config.seed),
        };
        for outcome in [
            self.clients[0].execute(&seize).await?,
            self.clients[0].execute(&UnlockAllMilestones {}).await?,
            self.clients[0].execute(&grant).await?,
        ] {
            self.check(outcome == LocalOutcome::Submitted, "elevated command not run locally")?;
        }
        self.clients[0].settle().await;
        self.note("player-level elevated commands settled");

        let denied = self.world.backend.stats().access_denied;
        self.check(denied == 3, format!("{} access denials", denied))?;
        self.check(self.world.backend.record(victim)?.digest() == before, "victim record untouched")?;
        self.check(
            self.world.backend.record(self.clients[0].player())?.digest() == own,
            "caller record untouched",
        )?;

        let token = self
            .world
            .tokens
            .create_admin_token()
            .map_err(|e| SimError::Config(e.to_string()))?;
        let operator = self.world.connect(0).await?.with_credentials(token);
        self.clients[0] = operator;
        self.note("operator connected with an admin credential");

        let repair = ForceCorrectRecord {
            target: victim,
            section: "currencies".into(),
            value: r#"{"coins":5}"#.into(),
        };
        self.clients[0].execute(&repair).await?;
        self.clients[0].execute(&UnlockAllMilestones {}).await?;
        self.clients[0].settle().await;

        let coins = self.world.backend.record(victim)?.balance(Currency::Coins);
        self.check(coins == 5, format!("victim holds {} coins after correction", coins))?;
        self.check(corrected.load(Ordering::Relaxed) == 1, "one correction published")?;

        let environment = self.world.config.backend.environment;
        let unlock_denied = !UnlockAllMilestones::METADATA.allowed_in(environment);
        let denied = self.world.backend.stats().access_denied;
        self.check(
            denied == 3 + u64::from(unlock_denied),
            format!("{} access denials in {}", denied, environment),
        )?;

        self.clients[1].resync().await?;
        let converged = self.world.converged(&self.clients).await?;
        self.check(converged, "caches converged after the correction")
    }

    // ========================================================================
    // DST-008: DESYNCED REPLICA
    // ========================================================================

    async fn desynced_replica(&mut self) -> Result<(), SimError> {
        info!("DST-008: DesyncedReplica - phantom kill on one replica");
        let game = GameConfig::default();
        self.clients = self.world.connect_all().await?;
        let players = self.players();

        let match_id = self.match_id("casual");
        let mut authority = self.world.start_match(match_id, GameSession::default())?;
        let mut replicas: Vec<MatchOracle> = players.iter().map(|_| authority.clone()).collect();
        self.world.finish_match(&mut authority);
        for replica in &mut replicas {
            replica.run_to_end(self.world.config.max_frames);
        }
        let trusted = authority.snapshot();

        let drifted = players[0];
        replicas[0].desync(drifted);
        self.check(replicas[0].snapshot() != trusted, "replica drifted")?;
        self.note(format!("replica of {} counts a phantom kill", drifted));

        for (index, replica) in replicas.iter().enumerate() {
            let outcome = self.clients[index]
                .execute_from_frame::<EndOfMatchRewards>(&replica.snapshot())
                .await?;
            self.check(
                matches!(outcome, LocalOutcome::Applied { .. }),
                format!("{} settled locally with {:?}", players[index], outcome),
            )?;
        }
        self.world.settle(&self.clients).await;

        let (coins, _) = expected_rewards(&game, &trusted, drifted).unwrap_or((0, 0));
        let record = self.world.backend.record(drifted)?;
        let pending: u64 = record.rewards.iter().map(|r| r.amount).sum();
        self.check(pending == coins, format!("backend granted {} coins, trusted frame {}", pending, coins))?;

        let resyncs = self.clients[0].stats().resyncs;
        self.check(resyncs >= 1, "drifted client resynchronized")?;
        let others = total(self.clients[1..].iter().map(|c| c.stats())).resyncs;
        self.check(others == 0, format!("{} resyncs on agreeing clients", others))?;

        let converged = self.world.converged(&self.clients).await?;
        self.check(converged, "every cache converged")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelink_core::{ConsensusConfig, QuorumPolicy};

    fn assert_passes(result: &ScenarioResult) {
        assert!(
            result.passed,
            "{} failed (seed {}): {:?}",
            result.scenario,
            result.seed,
            result.failure_reason
        );
    }

    #[test]
    fn test_dst_001_milestone_retry() {
        let result = ScenarioRunner::new(42, 1).run(ScenarioId::MilestoneRetry);
        assert_passes(&result);
        assert_eq!(result.metrics.network.dropped_acks, 1);
        assert_eq!(result.metrics.network.dropped_requests, 1);
        assert_eq!(result.metrics.backend.applied, 2);
    }

    #[test]
    fn test_dst_002_match_settlement() {
        for seed in [1, 7, 42, 1337] {
            let result = ScenarioRunner::new(seed, 4).run(ScenarioId::MatchSettlement);
            assert_passes(&result);
        }
    }

    #[test]
    fn test_dst_002_two_player_match() {
        let result = ScenarioRunner::new(9, 2).run(ScenarioId::MatchSettlement);
        assert_passes(&result);
    }

    #[test]
    fn test_dst_003_kick_vote() {
        let result = ScenarioRunner::new(42, 5).run(ScenarioId::KickVote);
        assert_passes(&result);
        assert_eq!(result.metrics.backend.applied, 1);
    }

    #[test]
    fn test_dst_004_split_vote() {
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::SplitVote);
        assert_passes(&result);
    }

    #[test]
    fn test_dst_004_split_vote_all_connected() {
        let backend = BackendConfig::default()
            .with_consensus(ConsensusConfig::default().with_quorum(QuorumPolicy::AllConnected));
        let result = ScenarioRunner::new(42, 4)
            .with_backend_config(backend)
            .run(ScenarioId::SplitVote);
        assert_passes(&result);
    }

    #[test]
    fn test_dst_005_vote_timeout() {
        let result = ScenarioRunner::new(42, 3).run(ScenarioId::VoteTimeout);
        assert_passes(&result);
        assert!(result.final_time_secs >= 10.0);
    }

    #[test]
    fn test_dst_006_stale_proof() {
        let result = ScenarioRunner::new(42, 4).run(ScenarioId::StaleProof);
        assert_passes(&result);
    }

    #[test]
    fn test_dst_007_access_escalation() {
        let result = ScenarioRunner::new(42, 2).run(ScenarioId::AccessEscalation);
        assert_passes(&result);
    }

    #[test]
    fn test_dst_008_desynced_replica() {
        let result = ScenarioRunner::new(42, 3).run(ScenarioId::DesyncedReplica);
        assert_passes(&result);
    }

    #[test]
    fn test_small_rosters_are_raised_to_scenario_minimum() {
        let result = ScenarioRunner::new(3, 1).run(ScenarioId::KickVote);
        assert_passes(&result);
    }

    #[test]
    fn test_same_seed_same_run() {
        let runner = ScenarioRunner::new(2024, 4);
        let (a, export_a) = runner.run_with_export(ScenarioId::MatchSettlement);
        let (b, export_b) = runner.run_with_export(ScenarioId::MatchSettlement);

        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.final_time_secs, b.final_time_secs);
        assert_eq!(export_a.run_id, export_b.run_id);
        assert_eq!(export_a.timeline.len(), export_b.timeline.len());
    }

    #[test]
    fn test_export_lists_every_client() {
        let (result, export) = ScenarioRunner::new(42, 4).run_with_export(ScenarioId::KickVote);
        assert_passes(&result);
        assert_eq!(export.records.len(), 4);
        assert!(export.passed);
        assert!(export.records.iter().all(|r| r.cache_converged.is_some()));
    }
}
