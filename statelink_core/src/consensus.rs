//! Consensus Resolver.
//!
//! Used when the backend has no trusted snapshot for an action, e.g. a vote
//! among participants to remove one of them. Independent submissions for
//! the same `ActionId` are buffered inside a bounded window and grouped by
//! structural equality. The first group to reach quorum is applied exactly
//! once; later submissions are acknowledged as no-ops. A window that
//! elapses, or a split where no group can still reach quorum, fails the
//! action without mutation.
//!
//! ```text
//! submit ──► proof ok? ──► settled? ──► expired? ──► group ──► quorum? ──► Resolved
//!                              │            │                     │
//!                              ▼            ▼                     ▼
//!                         AlreadyResolved  Timeout        unreachable ─► Divergence
//! ```

use crate::command::AnyCommand;
use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, DispatchError, ProofError};
use crate::frame::{GameSession, SimulationValues};
use crate::trust::{IdentityProof, SessionRegistry};
use statelink_env::{ActionId, FieldBag, MatchId, PlayerId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A command accepted only once enough participants agree on it.
pub trait ConsensusCommand: AnyCommand {
    /// Logical action the submission votes on.
    fn action_id(&self) -> ActionId;

    fn match_id(&self) -> &MatchId;

    /// Record the resolved command is applied to.
    fn subject(&self) -> PlayerId;

    /// Field-level equality; proofs and derived values are ignored.
    fn structurally_equals(&self, other: &dyn ConsensusCommand) -> bool;

    fn attach_derived_values(&mut self, values: &SimulationValues);

    fn attach_identity_proof(&mut self, proof: IdentityProof);

    fn identity_proof(&self) -> Option<&IdentityProof>;

    fn as_command(&self) -> &dyn AnyCommand;
}

/// One participant's submission.
pub struct Submission {
    pub voter: PlayerId,
    pub command: Box<dyn ConsensusCommand>,
    /// Field bag the proof was signed over
    pub signed_fields: FieldBag,
    /// Currently connected participants of the match
    pub connected: usize,
}

/// Outcome of one submission.
#[derive(Debug)]
pub enum ConsensusVerdict {
    Pending { supporters: usize, quorum: usize },
    /// Quorum reached by this submission; apply exactly once
    Resolved(Box<dyn ConsensusCommand>),
    /// Action was resolved earlier; acknowledge without effect
    AlreadyResolved,
}

struct VoteGroup {
    candidate: Box<dyn ConsensusCommand>,
    supporters: Vec<PlayerId>,
}

struct PendingAction {
    match_id: MatchId,
    deadline: Duration,
    groups: Vec<VoteGroup>,
    voters: HashSet<PlayerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Resolved,
    Failed,
}

/// Bounded map from action id to buffered submissions.
pub struct ConsensusResolver {
    config: ConsensusConfig,
    pending: HashMap<ActionId, PendingAction>,
    /// Outcome markers kept for `retention` so late votes stay no-ops
    settled: HashMap<ActionId, (Settlement, Duration)>,
}

impl ConsensusResolver {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            settled: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn submit(
        &mut self,
        now: Duration,
        sessions: &SessionRegistry,
        submission: Submission,
    ) -> Result<ConsensusVerdict, DispatchError> {
        let Submission {
            voter,
            command,
            signed_fields,
            connected,
        } = submission;
        let action = command.action_id();

        let proof = command.identity_proof().ok_or(ProofError::Missing)?;
        sessions.verify(proof, voter, &action, &signed_fields)?;

        match self.settled.get(&action) {
            Some((Settlement::Resolved, _)) => {
                debug!(action = %action, voter = %voter, "late vote on resolved action");
                return Ok(ConsensusVerdict::AlreadyResolved);
            }
            Some((Settlement::Failed, _)) => {
                return Err(ConsensusError::AlreadyFailed(action).into());
            }
            None => {}
        }

        if self.pending.get(&action).is_some_and(|p| now >= p.deadline) {
            self.fail(&action, now);
            warn!(action = %action, "consensus window elapsed");
            return Err(ConsensusError::Timeout(action).into());
        }

        if !self.pending.contains_key(&action) && self.pending.len() >= self.config.max_pending {
            return Err(ConsensusError::Capacity(self.config.max_pending).into());
        }

        let quorum = self.config.quorum.required(connected);
        let deadline = now + self.config.window();
        let entry = self
            .pending
            .entry(action.clone())
            .or_insert_with(|| PendingAction {
                match_id: command.match_id().clone(),
                deadline,
                groups: Vec::new(),
                voters: HashSet::new(),
            });

        if !entry.voters.insert(voter) {
            let supporters = entry.groups.iter().map(|g| g.supporters.len()).max().unwrap_or(0);
            return Ok(ConsensusVerdict::Pending { supporters, quorum });
        }

        let index = match entry
            .groups
            .iter()
            .position(|g| g.candidate.structurally_equals(command.as_ref()))
        {
            Some(index) => {
                entry.groups[index].supporters.push(voter);
                index
            }
            None => {
                entry.groups.push(VoteGroup {
                    candidate: command,
                    supporters: vec![voter],
                });
                entry.groups.len() - 1
            }
        };

        let supporters = entry.groups[index].supporters.len();
        if supporters >= quorum {
            let resolved = self.pending.remove(&action).map(|mut p| p.groups.swap_remove(index));
            self.settled
                .insert(action.clone(), (Settlement::Resolved, now + self.config.retention()));
            return match resolved {
                Some(group) => {
                    info!(action = %action, supporters, quorum, "consensus reached");
                    Ok(ConsensusVerdict::Resolved(group.candidate))
                }
                None => Err(DispatchError::unexpected("resolved action vanished")),
            };
        }

        let best = entry.groups.iter().map(|g| g.supporters.len()).max().unwrap_or(0);
        let remaining = connected.saturating_sub(entry.voters.len());
        if best + remaining < quorum {
            warn!(action = %action, groups = entry.groups.len(), quorum, "consensus diverged");
            self.fail(&action, now);
            return Err(ConsensusError::Divergence(action).into());
        }

        Ok(ConsensusVerdict::Pending { supporters, quorum })
    }

    /// Fails every action past its deadline and forgets expired markers.
    pub fn sweep(&mut self, now: Duration) -> Vec<ActionId> {
        let expired: Vec<ActionId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(action, _)| action.clone())
            .collect();
        for action in &expired {
            self.fail(action, now);
            warn!(action = %action, "consensus window elapsed");
        }
        self.settled.retain(|_, (_, until)| now < *until);
        expired
    }

    /// Drops every pending action of a match.
    pub fn forget_match(&mut self, match_id: &MatchId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| &p.match_id != match_id);
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    pub fn is_resolved(&self, action: &ActionId) -> bool {
        matches!(self.settled.get(action), Some((Settlement::Resolved, _)))
    }

    fn fail(&mut self, action: &ActionId, now: Duration) {
        self.pending.remove(action);
        self.settled
            .insert(action.clone(), (Settlement::Failed, now + self.config.retention()));
    }
}

// ============================================================================
// MATCH ROSTER
// ============================================================================

struct RosterEntry {
    participants: BTreeMap<PlayerId, bool>,
    session: GameSession,
}

/// Participants of running matches and whether they are connected.
#[derive(Default)]
pub struct MatchRoster {
    matches: HashMap<MatchId, RosterEntry>,
}

impl MatchRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a match with every participant connected.
    pub fn register(
        &mut self,
        match_id: MatchId,
        participants: impl IntoIterator<Item = PlayerId>,
        session: GameSession,
    ) {
        let participants = participants.into_iter().map(|p| (p, true)).collect();
        self.matches
            .insert(match_id, RosterEntry { participants, session });
    }

    pub fn set_connected(
        &mut self,
        match_id: &MatchId,
        player: PlayerId,
        connected: bool,
    ) -> Result<(), ConsensusError> {
        let entry = self
            .matches
            .get_mut(match_id)
            .ok_or_else(|| ConsensusError::UnknownMatch(match_id.clone()))?;
        let slot = entry
            .participants
            .get_mut(&player)
            .ok_or_else(|| ConsensusError::NotAParticipant {
                player,
                match_id: match_id.clone(),
            })?;
        *slot = connected;
        Ok(())
    }

    pub fn connected_count(&self, match_id: &MatchId) -> Result<usize, ConsensusError> {
        self.matches
            .get(match_id)
            .map(|e| e.participants.values().filter(|c| **c).count())
            .ok_or_else(|| ConsensusError::UnknownMatch(match_id.clone()))
    }

    /// Only connected participants may vote.
    pub fn check_voter(&self, match_id: &MatchId, player: PlayerId) -> Result<(), ConsensusError> {
        let entry = self
            .matches
            .get(match_id)
            .ok_or_else(|| ConsensusError::UnknownMatch(match_id.clone()))?;
        match entry.participants.get(&player) {
            Some(true) => Ok(()),
            _ => Err(ConsensusError::NotAParticipant {
                player,
                match_id: match_id.clone(),
            }),
        }
    }

    /// Connected or not, `player` is on the roster of `match_id`.
    pub fn is_participant(&self, match_id: &MatchId, player: PlayerId) -> bool {
        self.matches
            .get(match_id)
            .is_some_and(|e| e.participants.contains_key(&player))
    }

    /// Votes may only remove a player who is on the match roster.
    pub fn check_target(&self, match_id: &MatchId, player: PlayerId) -> Result<(), ConsensusError> {
        if self.is_participant(match_id, player) {
            Ok(())
        } else {
            Err(ConsensusError::TargetNotInMatch {
                player,
                match_id: match_id.clone(),
            })
        }
    }

    pub fn session(&self, match_id: &MatchId) -> Option<&GameSession> {
        self.matches.get(match_id).map(|e| &e.session)
    }

    pub fn end(&mut self, match_id: &MatchId) -> bool {
        self.matches.remove(match_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_fields;
    use crate::commands::RemoveParticipant;
    use crate::config::QuorumPolicy;
    use ed25519_dalek::SigningKey;
    use statelink_env::SessionId;

    struct Voters {
        registry: SessionRegistry,
        keys: Vec<(PlayerId, SessionId, SigningKey)>,
    }

    fn voters(count: u64) -> Voters {
        let mut registry = SessionRegistry::new();
        let keys = (0..count)
            .map(|i| {
                let player = PlayerId::from_seed(i);
                let session = SessionId::from_seed(100 + i);
                let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
                registry.open(player, session, Some(key.verifying_key()), Duration::ZERO);
                (player, session, key)
            })
            .collect();
        Voters { registry, keys }
    }

    fn kick(v: &Voters, voter: usize, target: PlayerId, reason: &str, connected: usize) -> Submission {
        let (player, session, key) = &v.keys[voter];
        let mut command = RemoveParticipant::new(MatchId::new("m1"), target, reason);
        let fields = encode_fields(&command).unwrap();
        command.attach_identity_proof(IdentityProof::sign(key, *player, *session, &command.action_id(), &fields));
        Submission {
            voter: *player,
            command: Box::new(command),
            signed_fields: fields,
            connected,
        }
    }

    fn resolver() -> ConsensusResolver {
        ConsensusResolver::new(ConsensusConfig::default())
    }

    #[test]
    fn test_two_of_three_resolves_once() {
        let v = voters(3);
        let target = PlayerId::from_seed(9);
        let mut resolver = resolver();
        let t = Duration::from_millis(10);

        let first = resolver.submit(t, &v.registry, kick(&v, 0, target, "afk", 3)).unwrap();
        assert!(matches!(first, ConsensusVerdict::Pending { supporters: 1, quorum: 2 }));

        match resolver.submit(t, &v.registry, kick(&v, 1, target, "afk", 3)).unwrap() {
            ConsensusVerdict::Resolved(command) => assert_eq!(command.subject(), target),
            other => panic!("expected resolution, got {:?}", other),
        }
        assert_eq!(resolver.pending_count(), 0);

        let late = resolver.submit(t, &v.registry, kick(&v, 2, target, "afk", 3)).unwrap();
        assert!(matches!(late, ConsensusVerdict::AlreadyResolved));
    }

    #[test]
    fn test_duplicate_voter_counts_once() {
        let v = voters(3);
        let mut resolver = resolver();
        let t = Duration::ZERO;

        resolver.submit(t, &v.registry, kick(&v, 0, PlayerId::from_seed(9), "afk", 3)).unwrap();
        let again = resolver.submit(t, &v.registry, kick(&v, 0, PlayerId::from_seed(9), "afk", 3)).unwrap();
        assert!(matches!(again, ConsensusVerdict::Pending { supporters: 1, .. }));
    }

    #[test]
    fn test_split_vote_diverges() {
        let v = voters(3);
        let target = PlayerId::from_seed(9);
        let mut resolver = resolver().with_quorum_for_test(QuorumPolicy::AllConnected);
        let t = Duration::ZERO;

        resolver.submit(t, &v.registry, kick(&v, 0, target, "afk", 3)).unwrap();
        let err = resolver
            .submit(t, &v.registry, kick(&v, 1, target, "cheating", 3))
            .unwrap_err();
        assert_eq!(err.code(), "consensus_divergence");
        assert_eq!(resolver.pending_count(), 0);

        let err = resolver.submit(t, &v.registry, kick(&v, 2, target, "afk", 3)).unwrap_err();
        assert_eq!(err.code(), "consensus_rejected");
    }

    #[test]
    fn test_window_elapses() {
        let v = voters(3);
        let target = PlayerId::from_seed(9);
        let mut resolver = resolver();

        resolver.submit(Duration::ZERO, &v.registry, kick(&v, 0, target, "afk", 3)).unwrap();
        let late = Duration::from_millis(5_000);
        let err = resolver.submit(late, &v.registry, kick(&v, 1, target, "afk", 3)).unwrap_err();
        assert_eq!(err.code(), "consensus_timeout");
        assert!(!resolver.is_resolved(&ActionId::new(format!("remove_participant:m1:{}", target.as_uuid()))));
    }

    #[test]
    fn test_sweep_bounds_memory() {
        let v = voters(3);
        let mut resolver = resolver();

        resolver.submit(Duration::ZERO, &v.registry, kick(&v, 0, PlayerId::from_seed(8), "afk", 3)).unwrap();
        resolver.submit(Duration::ZERO, &v.registry, kick(&v, 0, PlayerId::from_seed(9), "afk", 3)).unwrap();
        assert_eq!(resolver.pending_count(), 2);

        assert_eq!(resolver.sweep(Duration::from_millis(4_999)).len(), 0);
        assert_eq!(resolver.sweep(Duration::from_millis(5_000)).len(), 2);
        assert_eq!(resolver.pending_count(), 0);
        assert_eq!(resolver.settled_count(), 2);

        resolver.sweep(Duration::from_millis(5_000 + 60_000));
        assert_eq!(resolver.settled_count(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let v = voters(1);
        let mut resolver = ConsensusResolver::new(ConsensusConfig::default().with_max_pending(1));

        resolver.submit(Duration::ZERO, &v.registry, kick(&v, 0, PlayerId::from_seed(8), "afk", 3)).unwrap();
        let err = resolver
            .submit(Duration::ZERO, &v.registry, kick(&v, 0, PlayerId::from_seed(9), "afk", 3))
            .unwrap_err();
        assert_eq!(err, DispatchError::Consensus(ConsensusError::Capacity(1)));
    }

    #[test]
    fn test_replayed_proof_from_old_session_rejected() {
        let mut v = voters(3);
        let target = PlayerId::from_seed(9);
        let stale = kick(&v, 0, target, "afk", 3);

        let (player, _, key) = &v.keys[0];
        v.registry.open(*player, SessionId::from_seed(999), Some(key.verifying_key()), Duration::from_secs(1));

        let err = resolver().submit(Duration::ZERO, &v.registry, stale).unwrap_err();
        assert!(matches!(err, DispatchError::Proof(ProofError::StaleSession { .. })));
    }

    #[test]
    fn test_missing_proof_rejected() {
        let v = voters(1);
        let command = RemoveParticipant::new(MatchId::new("m1"), PlayerId::from_seed(9), "afk");
        let submission = Submission {
            voter: v.keys[0].0,
            signed_fields: encode_fields(&command).unwrap(),
            command: Box::new(command),
            connected: 3,
        };
        let err = resolver().submit(Duration::ZERO, &v.registry, submission).unwrap_err();
        assert_eq!(err, DispatchError::Proof(ProofError::Missing));
    }

    #[test]
    fn test_roster_tracks_connected_voters() {
        let mut roster = MatchRoster::new();
        let match_id = MatchId::new("m1");
        roster.register(match_id.clone(), (0..4).map(PlayerId::from_seed), GameSession::default());

        assert_eq!(roster.connected_count(&match_id), Ok(4));
        roster.set_connected(&match_id, PlayerId::from_seed(3), false).unwrap();
        assert_eq!(roster.connected_count(&match_id), Ok(3));
        assert!(roster.check_voter(&match_id, PlayerId::from_seed(3)).is_err());
        assert!(roster.check_voter(&match_id, PlayerId::from_seed(7)).is_err());
        assert!(roster.check_voter(&MatchId::new("nope"), PlayerId::from_seed(0)).is_err());

        // A disconnected participant can still be voted out; a stranger cannot
        assert!(roster.is_participant(&match_id, PlayerId::from_seed(3)));
        assert_eq!(roster.check_target(&match_id, PlayerId::from_seed(3)), Ok(()));
        assert_eq!(
            roster.check_target(&match_id, PlayerId::from_seed(7)),
            Err(ConsensusError::TargetNotInMatch { player: PlayerId::from_seed(7), match_id: match_id.clone() })
        );
        assert!(!roster.is_participant(&MatchId::new("nope"), PlayerId::from_seed(0)));
        assert!(roster.end(&match_id));
    }

    impl ConsensusResolver {
        fn with_quorum_for_test(mut self, quorum: QuorumPolicy) -> Self {
            self.config = self.config.clone().with_quorum(quorum);
            self
        }
    }
}
