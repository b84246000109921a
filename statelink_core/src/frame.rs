//! Frame Derivation Adapter.
//!
//! For simulation-authoritative commands the client's submission is only a
//! trigger naming the match. The adapter fetches the trusted snapshot for
//! that match and rebuilds every command field from it through
//! `FrameDerived::derive_from_frame`; the submitted fields are never read
//! beyond the trigger.

use crate::codec::read_field;
use crate::command::GameCommand;
use crate::error::{DispatchError, FieldError};
use serde::{Deserialize, Serialize};
use statelink_env::{FieldBag, MatchId, PlayerId};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchPhase {
    Running,
    Ended,
}

/// Singleton game-session state of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    pub game_mode: String,
    pub ranked: bool,
    /// Mode lets results settle before the match reaches its end state
    pub allow_early_settlement: bool,
    /// Mode grants end-of-match rewards at all
    pub rewards_enabled: bool,
}

impl Default for GameSession {
    fn default() -> Self {
        Self {
            game_mode: "battle_royale".to_string(),
            ranked: false,
            allow_early_settlement: false,
            rewards_enabled: true,
        }
    }
}

/// One participant's standing in a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementResult {
    pub player: PlayerId,
    pub placement: u32,
    pub kills: u32,
    pub damage: u32,
    pub quit: bool,
}

/// A snapshot of the replicated simulation at one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFrame {
    pub match_id: MatchId,
    pub frame: u64,
    pub phase: MatchPhase,
    pub session: GameSession,
    pub results: Vec<PlacementResult>,
}

impl MatchFrame {
    pub fn result_for(&self, player: PlayerId) -> Option<&PlacementResult> {
        self.results.iter().find(|r| r.player == player)
    }

    pub fn is_ended(&self) -> bool {
        self.phase == MatchPhase::Ended
    }
}

/// Values every participant computes identically from the same frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationValues {
    pub match_id: MatchId,
    pub executing_player: PlayerId,
    pub ranked: bool,
    pub game_mode: String,
    pub frame: u64,
}

impl SimulationValues {
    pub fn from_frame(frame: &MatchFrame, executing_player: PlayerId) -> Self {
        Self::from_session(frame.match_id.clone(), &frame.session, executing_player, frame.frame)
    }

    pub fn from_session(
        match_id: MatchId,
        session: &GameSession,
        executing_player: PlayerId,
        frame: u64,
    ) -> Self {
        Self {
            match_id,
            executing_player,
            ranked: session.ranked,
            game_mode: session.game_mode.clone(),
            frame,
        }
    }
}

/// Outcome of a derivation: a fully trusted command or a guarded no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum Derivation<C> {
    Apply(C),
    /// Accepted without effect; the reason is logged
    NoOp(&'static str),
}

impl<C> Derivation<C> {
    pub fn map<D>(self, f: impl FnOnce(C) -> D) -> Derivation<D> {
        match self {
            Self::Apply(command) => Derivation::Apply(f(command)),
            Self::NoOp(reason) => Derivation::NoOp(reason),
        }
    }
}

/// Commands whose authoritative fields come from a trusted frame.
pub trait FrameDerived: GameCommand + Sized {
    /// Reads the trigger (the match) out of a submission.
    fn trigger(fields: &FieldBag) -> Result<MatchId, FieldError> {
        read_field(fields, "match_id")
    }

    /// Rebuilds the command from a frame. Must be pure.
    fn derive_from_frame(frame: &MatchFrame, values: &SimulationValues) -> Derivation<Self>;
}

/// Read-only access to trusted simulation state.
pub trait SnapshotSource: Send + Sync {
    /// Latest trusted results of a match.
    fn match_results(&self, match_id: &MatchId) -> Option<MatchFrame>;

    /// Singleton session state of a match.
    fn game_session(&self, match_id: &MatchId) -> Option<GameSession> {
        self.match_results(match_id).map(|frame| frame.session)
    }
}

/// A derivation together with the values it was computed from.
#[derive(Debug, Clone)]
pub struct Derived<C> {
    pub derivation: Derivation<C>,
    pub values: SimulationValues,
}

/// Recomputes simulation-authoritative commands from trusted snapshots.
#[derive(Clone, Default)]
pub struct FrameDerivationAdapter {
    source: Option<Arc<dyn SnapshotSource>>,
}

impl FrameDerivationAdapter {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// An adapter with no trusted source; every lookup misses.
    pub fn unavailable() -> Self {
        Self { source: None }
    }

    pub fn has_snapshot(&self, match_id: &MatchId) -> bool {
        self.frame(match_id).is_some()
    }

    pub fn frame(&self, match_id: &MatchId) -> Option<MatchFrame> {
        self.source.as_ref()?.match_results(match_id)
    }

    pub fn game_session(&self, match_id: &MatchId) -> Option<GameSession> {
        self.source.as_ref()?.game_session(match_id)
    }

    /// Derives `C` for `executing_player`, discarding submitted fields.
    pub fn derive<C: FrameDerived>(
        &self,
        fields: &FieldBag,
        executing_player: PlayerId,
    ) -> Result<Derived<C>, DispatchError> {
        let match_id = C::trigger(fields)?;
        let frame = self
            .frame(&match_id)
            .ok_or_else(|| DispatchError::NoTrustedSource(format!("match {}", match_id)))?;
        let values = SimulationValues::from_frame(&frame, executing_player);
        Ok(Derived {
            derivation: C::derive_from_frame(&frame, &values),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::EndOfMatchRewards;
    use std::collections::HashMap;
    use std::sync::RwLock;

    #[derive(Default)]
    struct FixedSnapshots(RwLock<HashMap<MatchId, MatchFrame>>);

    impl SnapshotSource for FixedSnapshots {
        fn match_results(&self, match_id: &MatchId) -> Option<MatchFrame> {
            self.0.read().unwrap().get(match_id).cloned()
        }
    }

    fn frame(phase: MatchPhase) -> MatchFrame {
        MatchFrame {
            match_id: MatchId::new("m1"),
            frame: 900,
            phase,
            session: GameSession { ranked: true, ..GameSession::default() },
            results: vec![
                PlacementResult { player: PlayerId::from_seed(1), placement: 2, kills: 1, damage: 300, quit: false },
                PlacementResult { player: PlayerId::from_seed(2), placement: 1, kills: 4, damage: 900, quit: false },
            ],
        }
    }

    fn adapter_with(frame: MatchFrame) -> FrameDerivationAdapter {
        let source = FixedSnapshots::default();
        source.0.write().unwrap().insert(frame.match_id.clone(), frame);
        FrameDerivationAdapter::new(Arc::new(source))
    }

    fn forged_fields() -> FieldBag {
        // Claims first place; only match_id may survive derivation
        let forged = EndOfMatchRewards {
            match_id: MatchId::new("m1"),
            player: PlayerId::from_seed(1),
            placement: 1,
            kills: 40,
            ranked: true,
        };
        crate::codec::encode_fields(&forged).unwrap()
    }

    #[test]
    fn test_submitted_fields_are_discarded() {
        let adapter = adapter_with(frame(MatchPhase::Ended));
        let derived = adapter
            .derive::<EndOfMatchRewards>(&forged_fields(), PlayerId::from_seed(1))
            .unwrap();

        match derived.derivation {
            Derivation::Apply(command) => {
                assert_eq!(command.placement, 2);
                assert_eq!(command.kills, 1);
                assert_eq!(command.player, PlayerId::from_seed(1));
            }
            other => panic!("expected derived command, got {:?}", other),
        }
        assert_eq!(derived.values.executing_player, PlayerId::from_seed(1));
        assert!(derived.values.ranked);
    }

    #[test]
    fn test_guard_marks_unfinished_match_noop() {
        let adapter = adapter_with(frame(MatchPhase::Running));
        let derived = adapter
            .derive::<EndOfMatchRewards>(&forged_fields(), PlayerId::from_seed(1))
            .unwrap();
        assert!(matches!(derived.derivation, Derivation::NoOp(_)));

        let mut early = frame(MatchPhase::Running);
        early.session.allow_early_settlement = true;
        let derived = adapter_with(early)
            .derive::<EndOfMatchRewards>(&forged_fields(), PlayerId::from_seed(1))
            .unwrap();
        assert!(matches!(derived.derivation, Derivation::Apply(_)));
    }

    #[test]
    fn test_missing_snapshot_is_no_trusted_source() {
        let adapter = FrameDerivationAdapter::unavailable();
        let err = adapter
            .derive::<EndOfMatchRewards>(&forged_fields(), PlayerId::from_seed(1))
            .unwrap_err();
        assert_eq!(err.code(), "no_trusted_source");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let snapshot = frame(MatchPhase::Ended);
        for player in [PlayerId::from_seed(1), PlayerId::from_seed(2)] {
            let values = SimulationValues::from_frame(&snapshot, player);
            assert_eq!(
                EndOfMatchRewards::derive_from_frame(&snapshot, &values),
                EndOfMatchRewards::derive_from_frame(&snapshot, &values)
            );
        }
    }

    mod property {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_derive_from_frame_is_pure(
                placements in proptest::collection::vec((1u32..9, 0u32..20, any::<bool>()), 1..6),
                ended in any::<bool>(),
                ranked in any::<bool>(),
            ) {
                let results: Vec<PlacementResult> = placements
                    .iter()
                    .enumerate()
                    .map(|(i, (placement, kills, quit))| PlacementResult {
                        player: PlayerId::from_seed(i as u64),
                        placement: *placement,
                        kills: *kills,
                        damage: kills * 100,
                        quit: *quit,
                    })
                    .collect();
                let snapshot = MatchFrame {
                    match_id: MatchId::new("prop"),
                    frame: 1,
                    phase: if ended { MatchPhase::Ended } else { MatchPhase::Running },
                    session: GameSession { ranked, ..GameSession::default() },
                    results,
                };

                for result in &snapshot.results {
                    let values = SimulationValues::from_frame(&snapshot, result.player);
                    prop_assert_eq!(
                        EndOfMatchRewards::derive_from_frame(&snapshot, &values),
                        EndOfMatchRewards::derive_from_frame(&snapshot.clone(), &values.clone())
                    );
                }
            }
        }
    }
}
