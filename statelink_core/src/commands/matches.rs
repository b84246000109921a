use crate::command::{AccessLevel, AnyCommand, CommandMetadata, ExecutionMode, GameCommand};
use crate::consensus::ConsensusCommand;
use crate::context::ExecutionContext;
use crate::error::DomainError;
use crate::events::{MatchRewardsGranted, ParticipantRemoved};
use crate::frame::{Derivation, FrameDerived, MatchFrame, SimulationValues};
use crate::record::{Currency, Reward};
use crate::trust::IdentityProof;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statelink_env::{ActionId, MatchId, PlayerId};

/// Placement rewards for one finished match.
///
/// Every field is rebuilt from the trusted frame; a submission only names
/// the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndOfMatchRewards {
    pub match_id: MatchId,
    pub player: PlayerId,
    pub placement: u32,
    pub kills: u32,
    pub ranked: bool,
}

impl EndOfMatchRewards {
    /// Submission carrying only the trigger.
    pub fn trigger_for(match_id: MatchId, player: PlayerId) -> Self {
        Self {
            match_id,
            player,
            placement: 0,
            kills: 0,
            ranked: false,
        }
    }
}

#[async_trait]
impl GameCommand for EndOfMatchRewards {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "end_of_match_rewards",
        AccessLevel::Player,
        ExecutionMode::SimulationAuthoritative,
    );

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        if self.player != ctx.player() {
            return Err(DomainError::invalid("player", "derived for another participant"));
        }
        ctx.logic().history().mark_settled(&self.match_id)?;

        let rewards = ctx
            .logic()
            .rewards()
            .match_rewards(self.placement, self.kills, self.ranked);
        if rewards.coins > 0 {
            ctx.logic().rewards().queue(Reward {
                source: self.match_id.to_string(),
                currency: Currency::Coins,
                amount: rewards.coins,
            });
        }
        ctx.logic().progression().add_xp(rewards.xp);
        if rewards.trophy_delta != 0 {
            ctx.logic().progression().apply_trophies(rewards.trophy_delta);
        }

        let player = ctx.player();
        ctx.effects().publish(MatchRewardsGranted {
            player,
            match_id: self.match_id.clone(),
            placement: self.placement,
            rewards,
        });
        Ok(())
    }
}

impl FrameDerived for EndOfMatchRewards {
    fn derive_from_frame(frame: &MatchFrame, values: &SimulationValues) -> Derivation<Self> {
        if !frame.is_ended() && !frame.session.allow_early_settlement {
            return Derivation::NoOp("match has not ended");
        }
        if !frame.session.rewards_enabled {
            return Derivation::NoOp("mode grants no match rewards");
        }
        let Some(result) = frame.result_for(values.executing_player) else {
            return Derivation::NoOp("not a participant");
        };
        if result.quit {
            return Derivation::NoOp("participant quit");
        }

        Derivation::Apply(Self {
            match_id: frame.match_id.clone(),
            player: values.executing_player,
            placement: result.placement,
            kills: result.kills,
            ranked: values.ranked,
        })
    }
}

/// Vote to remove a participant from a match.
///
/// The backend has no snapshot of what happened between participants, so
/// the removal is applied to the target's record only once a quorum of
/// connected participants submits structurally equal votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveParticipant {
    pub match_id: MatchId,
    pub target: PlayerId,
    pub reason: String,

    #[serde(skip)]
    proof: Option<IdentityProof>,

    #[serde(skip)]
    values: Option<SimulationValues>,
}

impl RemoveParticipant {
    pub fn new(match_id: MatchId, target: PlayerId, reason: impl Into<String>) -> Self {
        Self {
            match_id,
            target,
            reason: reason.into(),
            proof: None,
            values: None,
        }
    }

    /// Simulation values attached by the authority, if any.
    pub fn values(&self) -> Option<&SimulationValues> {
        self.values.as_ref()
    }
}

#[async_trait]
impl GameCommand for RemoveParticipant {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "remove_participant",
        AccessLevel::Player,
        ExecutionMode::SimulationAuthoritative,
    );

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        if ctx.player() != self.target {
            return Err(DomainError::invalid("target", "removal applies to the target's record"));
        }
        ctx.logic().history().mark_removed(&self.match_id)?;

        let penalty = ctx.logic().config().removal_trophy_penalty;
        let trophies = ctx.logic().progression().apply_trophies(-penalty);

        ctx.effects().publish(ParticipantRemoved {
            player: self.target,
            match_id: self.match_id.clone(),
            trophies,
        });
        Ok(())
    }
}

impl ConsensusCommand for RemoveParticipant {
    fn action_id(&self) -> ActionId {
        ActionId::new(format!(
            "{}:{}:{}",
            Self::METADATA.type_tag,
            self.match_id,
            self.target.as_uuid()
        ))
    }

    fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    fn subject(&self) -> PlayerId {
        self.target
    }

    fn structurally_equals(&self, other: &dyn ConsensusCommand) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o.match_id == self.match_id && o.target == self.target && o.reason == self.reason)
    }

    fn attach_derived_values(&mut self, values: &SimulationValues) {
        self.values = Some(values.clone());
    }

    fn attach_identity_proof(&mut self, proof: IdentityProof) {
        self.proof = Some(proof);
    }

    fn identity_proof(&self) -> Option<&IdentityProof> {
        self.proof.as_ref()
    }

    fn as_command(&self) -> &dyn AnyCommand {
        self
    }
}
