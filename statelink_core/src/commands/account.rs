use crate::command::{AccessLevel, CommandMetadata, ExecutionMode, GameCommand};
use crate::context::ExecutionContext;
use crate::error::DomainError;
use crate::events::{CurrencyChanged, GameModeSelected, MilestoneCompleted, RecordMigrated};
use crate::record::{Currency, Milestone, SCHEMA_VERSION};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Brings a record up to the current schema. Runs once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizeRecord {}

#[async_trait]
impl GameCommand for SanitizeRecord {
    const METADATA: CommandMetadata =
        CommandMetadata::new("sanitize_record", AccessLevel::Service, ExecutionMode::Initialization);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let from = ctx.logic().maintenance().schema_version();
        if from >= SCHEMA_VERSION {
            return Err(DomainError::UpToDate(from));
        }

        // v1: starter balance
        if from < 1 {
            let starter = ctx.logic().config().starter_coins;
            ctx.logic().currency().credit(Currency::Coins, starter);
        }
        // v2: loadouts may only reference owned items
        if from < 2 {
            ctx.logic().maintenance().prune_loadout();
        }
        ctx.logic().maintenance().set_schema_version(SCHEMA_VERSION);

        let player = ctx.player();
        ctx.effects().publish(RecordMigrated {
            player,
            from,
            to: SCHEMA_VERSION,
        });
        Ok(())
    }
}

/// Completes a tutorial milestone and pays its reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteMilestone {
    pub milestone: Milestone,
}

#[async_trait]
impl GameCommand for CompleteMilestone {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "complete_milestone",
        AccessLevel::Player,
        ExecutionMode::ServerAuthoritative,
    );

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        ctx.logic().tutorial().complete(self.milestone)?;

        let player = ctx.player();
        let reward = ctx
            .logic()
            .config()
            .milestone_rewards
            .get(&self.milestone)
            .copied()
            .unwrap_or(0);
        if reward > 0 {
            let balance = ctx.logic().currency().credit(Currency::Coins, reward);
            ctx.effects().publish(CurrencyChanged {
                player,
                currency: Currency::Coins,
                delta: reward as i64,
                balance,
            });
        }
        ctx.effects().publish(MilestoneCompleted {
            player,
            milestone: self.milestone,
        });
        Ok(())
    }
}

/// Picks the game mode for the next match. Session state only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectGameMode {
    pub mode: String,
}

#[async_trait]
impl GameCommand for SelectGameMode {
    const METADATA: CommandMetadata =
        CommandMetadata::new("select_game_mode", AccessLevel::Player, ExecutionMode::LocalOnly);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        if ctx.session().selected_mode.as_deref() == Some(self.mode.as_str()) {
            return Err(DomainError::Unchanged(format!("game mode {}", self.mode)));
        }
        ctx.session().selected_mode = Some(self.mode.clone());
        ctx.effects().publish(GameModeSelected {
            mode: self.mode.clone(),
        });
        Ok(())
    }
}
