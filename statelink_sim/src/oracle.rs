//! Match oracle for simulation.
//!
//! Stands in for the replicated deterministic match simulation:
//! - Every participant runs a replica built from the same seed and roster
//! - Replicas step through identical eliminations, kills and damage
//! - The authority's replica feeds `TrustedSnapshots`
//!
//! A replica can be desynced on purpose to model a client that missed an
//! input.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use statelink_core::{GameSession, MatchFrame, MatchPhase, PlacementResult, SnapshotSource};
use statelink_env::{MatchId, PlayerId};
use std::collections::HashMap;
use std::sync::RwLock;

const STARTING_HEALTH: u32 = 100;
const DAMAGE_MEAN: f64 = 34.0;
const DAMAGE_STD_DEV: f64 = 12.0;

/// One participant inside a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fighter {
    player: PlayerId,
    health: u32,
    kills: u32,
    damage: u32,
    quit: bool,
    /// Set once eliminated (or as winner)
    placement: Option<u32>,
}

impl Fighter {
    fn alive(&self) -> bool {
        self.placement.is_none()
    }
}

/// A seeded replica of one match.
#[derive(Debug, Clone)]
pub struct MatchOracle {
    match_id: MatchId,

    /// Seed shared by every replica of this match
    seed: u64,

    rng: ChaCha8Rng,

    session: GameSession,

    fighters: Vec<Fighter>,

    /// Frames stepped so far
    frame: u64,

    damage: Option<Normal<f64>>,
}

impl MatchOracle {
    /// Creates a replica. Roster order must match across replicas.
    pub fn new(
        match_id: MatchId,
        seed: u64,
        participants: impl IntoIterator<Item = PlayerId>,
        session: GameSession,
    ) -> Self {
        let fighters = participants
            .into_iter()
            .map(|player| Fighter {
                player,
                health: STARTING_HEALTH,
                kills: 0,
                damage: 0,
                quit: false,
                placement: None,
            })
            .collect();

        Self {
            match_id,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            session,
            fighters,
            frame: 0,
            damage: Normal::new(DAMAGE_MEAN, DAMAGE_STD_DEV).ok(),
        }
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    pub fn participants(&self) -> Vec<PlayerId> {
        self.fighters.iter().map(|f| f.player).collect()
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn alive_count(&self) -> usize {
        self.fighters.iter().filter(|f| f.alive()).count()
    }

    pub fn is_ended(&self) -> bool {
        self.alive_count() <= 1
    }

    /// Advances one frame: one hit between two live participants.
    pub fn step(&mut self) {
        if self.is_ended() {
            return;
        }
        self.frame += 1;

        let alive: Vec<usize> = (0..self.fighters.len())
            .filter(|&i| self.fighters[i].alive())
            .collect();
        let attacker = alive[self.rng.gen_range(0..alive.len())];
        let victim = loop {
            let pick = alive[self.rng.gen_range(0..alive.len())];
            if pick != attacker {
                break pick;
            }
        };

        let roll = match &self.damage {
            Some(normal) => normal.sample(&mut self.rng),
            None => DAMAGE_MEAN,
        };
        let hit = (roll.round() as i64).clamp(1, STARTING_HEALTH as i64) as u32;
        let dealt = hit.min(self.fighters[victim].health);

        self.fighters[attacker].damage += dealt;
        self.fighters[victim].health -= dealt;
        if self.fighters[victim].health == 0 {
            self.fighters[attacker].kills += 1;
            self.eliminate(victim);
        }
    }

    /// Steps until one participant is left or `max_frames` elapse.
    pub fn run_to_end(&mut self, max_frames: u64) -> u64 {
        let start = self.frame;
        while !self.is_ended() && self.frame - start < max_frames {
            self.step();
        }
        self.frame - start
    }

    /// Removes a participant who left the match.
    pub fn quit(&mut self, player: PlayerId) -> bool {
        let Some(index) = self.fighters.iter().position(|f| f.player == player && f.alive()) else {
            return false;
        };
        self.fighters[index].quit = true;
        self.eliminate(index);
        true
    }

    /// Credits `player` with a phantom kill the other replicas never saw.
    pub fn desync(&mut self, player: PlayerId) {
        if let Some(fighter) = self.fighters.iter_mut().find(|f| f.player == player) {
            fighter.kills += 1;
            fighter.damage += STARTING_HEALTH;
        }
    }

    /// Snapshot of the current standings.
    ///
    /// Participants still alive share the worst undecided placement.
    pub fn snapshot(&self) -> MatchFrame {
        let alive = self.alive_count() as u32;
        let mut results: Vec<PlacementResult> = self
            .fighters
            .iter()
            .map(|f| PlacementResult {
                player: f.player,
                placement: f.placement.unwrap_or(alive),
                kills: f.kills,
                damage: f.damage,
                quit: f.quit,
            })
            .collect();
        results.sort_by_key(|r| r.placement);

        MatchFrame {
            match_id: self.match_id.clone(),
            frame: self.frame,
            phase: if self.is_ended() { MatchPhase::Ended } else { MatchPhase::Running },
            session: self.session.clone(),
            results,
        }
    }

    fn eliminate(&mut self, index: usize) {
        let placement = self.alive_count() as u32;
        self.fighters[index].placement = Some(placement);
        self.fighters[index].health = 0;

        if self.alive_count() == 1 {
            if let Some(winner) = self.fighters.iter_mut().find(|f| f.alive()) {
                winner.placement = Some(1);
            }
        }
    }
}

/// Snapshot source fed from the authority's own replicas.
#[derive(Default)]
pub struct TrustedSnapshots {
    frames: RwLock<HashMap<MatchId, MatchFrame>>,
}

impl TrustedSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the authority replica's latest frame.
    pub fn publish(&self, oracle: &MatchOracle) {
        if let Ok(mut frames) = self.frames.write() {
            frames.insert(oracle.match_id().clone(), oracle.snapshot());
        }
    }

    pub fn remove(&self, match_id: &MatchId) -> bool {
        self.frames
            .write()
            .map(|mut frames| frames.remove(match_id).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.frames.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotSource for TrustedSnapshots {
    fn match_results(&self, match_id: &MatchId) -> Option<MatchFrame> {
        self.frames.read().ok()?.get(match_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use statelink_core::commands::EndOfMatchRewards;
    use statelink_core::{FrameDerived, SimulationValues};

    fn roster(n: u64) -> Vec<PlayerId> {
        (0..n).map(PlayerId::from_seed).collect()
    }

    fn oracle(seed: u64, n: u64) -> MatchOracle {
        MatchOracle::new(MatchId::new("m-oracle"), seed, roster(n), GameSession::default())
    }

    #[test]
    fn test_match_runs_to_a_single_winner() {
        let mut match_oracle = oracle(42, 6);
        assert!(!match_oracle.snapshot().is_ended());

        match_oracle.run_to_end(10_000);
        let frame = match_oracle.snapshot();
        assert!(frame.is_ended());

        let mut placements: Vec<u32> = frame.results.iter().map(|r| r.placement).collect();
        placements.sort_unstable();
        assert_eq!(placements, vec![1, 2, 3, 4, 5, 6]);

        // Every elimination is somebody's kill
        let kills: u32 = frame.results.iter().map(|r| r.kills).sum();
        assert_eq!(kills, 5);
    }

    #[test]
    fn test_quit_takes_current_placement() {
        let mut match_oracle = oracle(3, 4);
        assert!(match_oracle.quit(PlayerId::from_seed(2)));
        assert!(!match_oracle.quit(PlayerId::from_seed(2)));

        let frame = match_oracle.snapshot();
        let quitter = frame.result_for(PlayerId::from_seed(2)).unwrap();
        assert!(quitter.quit);
        assert_eq!(quitter.placement, 4);
    }

    #[test]
    fn test_desync_diverges_from_replica() {
        let mut trusted = oracle(11, 4);
        let mut replica = trusted.clone();
        trusted.run_to_end(10_000);
        replica.run_to_end(10_000);
        assert_eq!(trusted.snapshot(), replica.snapshot());

        replica.desync(PlayerId::from_seed(1));
        assert_ne!(trusted.snapshot(), replica.snapshot());
    }

    #[test]
    fn test_trusted_snapshots_serve_latest_frame() {
        let snapshots = TrustedSnapshots::new();
        let mut match_oracle = oracle(5, 3);
        snapshots.publish(&match_oracle);
        assert_eq!(snapshots.match_results(match_oracle.match_id()).unwrap().phase, MatchPhase::Running);

        match_oracle.run_to_end(10_000);
        snapshots.publish(&match_oracle);
        assert!(snapshots.match_results(match_oracle.match_id()).unwrap().is_ended());
        assert_eq!(snapshots.len(), 1);

        assert!(snapshots.remove(match_oracle.match_id()));
        assert!(snapshots.match_results(match_oracle.match_id()).is_none());
    }

    proptest! {
        #[test]
        fn prop_replicas_derive_identical_rewards(seed in any::<u64>(), n in 2u64..8) {
            let mut a = oracle(seed, n);
            let mut b = oracle(seed, n);
            a.run_to_end(10_000);
            b.run_to_end(10_000);

            let (fa, fb) = (a.snapshot(), b.snapshot());
            prop_assert_eq!(&fa, &fb);
            for player in roster(n) {
                let va = SimulationValues::from_frame(&fa, player);
                let vb = SimulationValues::from_frame(&fb, player);
                prop_assert_eq!(
                    EndOfMatchRewards::derive_from_frame(&fa, &va),
                    EndOfMatchRewards::derive_from_frame(&fb, &vb)
                );
            }
        }
    }
}
