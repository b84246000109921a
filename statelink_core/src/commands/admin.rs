use crate::command::{AccessLevel, CommandMetadata, ExecutionMode, GameCommand};
use crate::config::Environment;
use crate::context::ExecutionContext;
use crate::error::DomainError;
use crate::events::{MilestoneCompleted, RecordCorrected};
use crate::record::Milestone;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statelink_env::PlayerId;

/// Overwrites one section of any player's record (support tooling).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceCorrectRecord {
    pub target: PlayerId,
    pub section: String,
    /// JSON text of the replacement section
    pub value: String,
}

#[async_trait]
impl GameCommand for ForceCorrectRecord {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "force_correct_record",
        AccessLevel::Admin,
        ExecutionMode::ServerAuthoritative,
    );

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        ctx.raw()?.replace_section(&self.section, &self.value)?;

        let player = ctx.player();
        ctx.effects().publish(RecordCorrected {
            player,
            section: self.section.clone(),
        });
        Ok(())
    }

    fn target(&self) -> Option<PlayerId> {
        Some(self.target)
    }
}

/// Completes every milestone without rewards. Development builds only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockAllMilestones {}

#[async_trait]
impl GameCommand for UnlockAllMilestones {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "unlock_all_milestones",
        AccessLevel::Admin,
        ExecutionMode::ServerAuthoritative,
    )
    .only_in(&[Environment::Development]);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let missing: Vec<Milestone> = Milestone::ALL
            .into_iter()
            .filter(|m| !ctx.data().tutorial.completed.contains(m))
            .collect();
        if missing.is_empty() {
            return Err(DomainError::AlreadyCompleted("all milestones".into()));
        }

        let player = ctx.player();
        for milestone in missing {
            ctx.logic().tutorial().complete(milestone)?;
            ctx.effects().publish(MilestoneCompleted { player, milestone });
        }
        Ok(())
    }
}
