//! Replication scenarios for DST.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// DST-001: Lost acknowledgement and dropped request, retried safely
    MilestoneRetry,

    /// DST-002: Frame-derived match rewards under forged submissions
    MatchSettlement,

    /// DST-003: Kick vote reaching quorum exactly once
    KickVote,

    /// DST-004: Votes that disagree structurally
    SplitVote,

    /// DST-005: Votes that never reach quorum before the window closes
    VoteTimeout,

    /// DST-006: Replayed proof from a retired session
    StaleProof,

    /// DST-007: Player-level caller reaching for elevated commands
    AccessEscalation,

    /// DST-008: A client replica that missed an input
    DesyncedReplica,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::MilestoneRetry,
            ScenarioId::MatchSettlement,
            ScenarioId::KickVote,
            ScenarioId::SplitVote,
            ScenarioId::VoteTimeout,
            ScenarioId::StaleProof,
            ScenarioId::AccessEscalation,
            ScenarioId::DesyncedReplica,
        ]
    }

    /// Returns the consensus scenarios only.
    pub fn consensus() -> Vec<ScenarioId> {
        vec![
            ScenarioId::KickVote,
            ScenarioId::SplitVote,
            ScenarioId::VoteTimeout,
            ScenarioId::StaleProof,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::MilestoneRetry => "milestone_retry",
            ScenarioId::MatchSettlement => "match_settlement",
            ScenarioId::KickVote => "kick_vote",
            ScenarioId::SplitVote => "split_vote",
            ScenarioId::VoteTimeout => "vote_timeout",
            ScenarioId::StaleProof => "stale_proof",
            ScenarioId::AccessEscalation => "access_escalation",
            ScenarioId::DesyncedReplica => "desynced_replica",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::MilestoneRetry => "Ack lost after a milestone completes; the retry is rewarded zero times",
            ScenarioId::MatchSettlement => "Every client claims first place; rewards come from the trusted frame only",
            ScenarioId::KickVote => "Connected participants vote a player out; the penalty lands once",
            ScenarioId::SplitVote => "Voters disagree on the reason; nothing is applied",
            ScenarioId::VoteTimeout => "A lone vote outlives the consensus window",
            ScenarioId::StaleProof => "A proof signed in a retired session is replayed",
            ScenarioId::AccessEscalation => "A player submits admin and service commands",
            ScenarioId::DesyncedReplica => "A replica with a phantom kill settles, then resynchronizes",
        }
    }

    /// Returns true if the scenario drives the consensus resolver.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            ScenarioId::KickVote | ScenarioId::SplitVote | ScenarioId::VoteTimeout | ScenarioId::StaleProof
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "milestone_retry" | "milestoneretry" | "a" | "dst-001" => Ok(ScenarioId::MilestoneRetry),
            "match_settlement" | "matchsettlement" | "b" | "dst-002" => Ok(ScenarioId::MatchSettlement),
            "kick_vote" | "kickvote" | "dst-003" => Ok(ScenarioId::KickVote),
            "split_vote" | "splitvote" | "dst-004" => Ok(ScenarioId::SplitVote),
            "vote_timeout" | "votetimeout" | "dst-005" => Ok(ScenarioId::VoteTimeout),
            "stale_proof" | "staleproof" | "dst-006" => Ok(ScenarioId::StaleProof),
            "access_escalation" | "accessescalation" | "dst-007" => Ok(ScenarioId::AccessEscalation),
            "desynced_replica" | "desyncedreplica" | "dst-008" => Ok(ScenarioId::DesyncedReplica),
            "consensus" => Err("Use --scenario all, or name a single consensus scenario".to_string()),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
