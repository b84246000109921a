//! Execution Context.
//!
//! Built fresh for every dispatch around a working copy of the record and
//! dropped when the command returns. The borrow of the working copy is what
//! keeps a command from retaining it.

use crate::command::{AccessLevel, AnyCommand};
use crate::error::DomainError;
use crate::events::{panic_message, OutcomeEvent};
use crate::frame::SimulationValues;
use crate::logic::{GameConfig, GameLogic, RawRecordAccess};
use crate::record::PlayerRecord;
use futures::FutureExt;
use statelink_env::PlayerId;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;

/// Ephemeral per-session client state touched by local-only commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub selected_mode: Option<String>,
    pub seen_notifications: BTreeSet<String>,
}

/// Side-effect surface: events staged until the mutation set commits.
#[derive(Debug, Default)]
pub struct Effects {
    events: Vec<Box<dyn OutcomeEvent>>,
}

impl Effects {
    pub fn publish<E: OutcomeEvent>(&mut self, event: E) {
        self.events.push(Box::new(event));
    }

    pub fn staged(&self) -> usize {
        self.events.len()
    }
}

/// Handles passed into a command's `execute`.
pub struct ExecutionContext<'a> {
    player: PlayerId,
    access: AccessLevel,
    logic: GameLogic<'a>,
    persisted: &'a PlayerRecord,
    session: &'a mut SessionState,
    effects: &'a mut Effects,
    values: Option<&'a SimulationValues>,
}

impl<'a> ExecutionContext<'a> {
    /// Record owner the command runs against.
    pub fn player(&self) -> PlayerId {
        self.player
    }

    /// Mutator surfaces over the working copy.
    pub fn logic(&mut self) -> &mut GameLogic<'a> {
        &mut self.logic
    }

    /// The record as persisted before this command started.
    pub fn data(&self) -> &PlayerRecord {
        self.persisted
    }

    pub fn session(&mut self) -> &mut SessionState {
        &mut *self.session
    }

    pub fn effects(&mut self) -> &mut Effects {
        &mut *self.effects
    }

    /// Derived values when the command came from a simulation frame.
    pub fn simulation(&self) -> Option<&SimulationValues> {
        self.values
    }

    /// Bulk section access for Admin-level force-correction.
    pub fn raw(&mut self) -> Result<RawRecordAccess<'_>, DomainError> {
        if self.access != AccessLevel::Admin {
            return Err(DomainError::RawAccessDenied);
        }
        Ok(self.logic.raw())
    }
}

/// Inputs of one atomic execution.
pub(crate) struct Dispatch<'a> {
    pub player: PlayerId,
    pub access: AccessLevel,
    pub record: &'a PlayerRecord,
    pub session: &'a SessionState,
    pub values: Option<&'a SimulationValues>,
    pub config: &'a GameConfig,
}

/// Committed outcome of an execution.
pub(crate) struct Applied {
    pub record: PlayerRecord,
    pub session: SessionState,
    pub events: Vec<Box<dyn OutcomeEvent>>,
}

#[derive(Debug)]
pub(crate) enum ExecutionFailure {
    Domain(DomainError),
    Panicked(String),
}

/// Runs a command against copies of the record and session state.
///
/// Either every mutation and every staged event comes back in `Applied`,
/// or nothing does; a panic inside the command counts as nothing.
pub(crate) async fn execute_atomically(
    command: &dyn AnyCommand,
    dispatch: Dispatch<'_>,
) -> Result<Applied, ExecutionFailure> {
    let mut working = dispatch.record.clone();
    let mut session = dispatch.session.clone();
    let mut effects = Effects::default();

    let outcome = {
        let mut ctx = ExecutionContext {
            player: dispatch.player,
            access: dispatch.access,
            logic: GameLogic::new(&mut working, dispatch.config),
            persisted: dispatch.record,
            session: &mut session,
            effects: &mut effects,
            values: dispatch.values,
        };
        AssertUnwindSafe(command.execute_any(&mut ctx))
            .catch_unwind()
            .await
    };

    match outcome {
        Ok(Ok(())) => Ok(Applied {
            record: working,
            session,
            events: effects.events,
        }),
        Ok(Err(domain)) => Err(ExecutionFailure::Domain(domain)),
        Err(payload) => Err(ExecutionFailure::Panicked(panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandMetadata, ExecutionMode, GameCommand};
    use crate::commands::{CompleteMilestone, ForceCorrectRecord};
    use crate::record::{Currency, Milestone};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    /// Mutates, stages an event, then blows up.
    #[derive(Debug, Serialize, Deserialize)]
    struct HalfWay {}

    #[async_trait]
    impl GameCommand for HalfWay {
        const METADATA: CommandMetadata =
            CommandMetadata::new("half_way", AccessLevel::Player, ExecutionMode::ServerAuthoritative);

        async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
            ctx.logic().currency().credit(Currency::Gems, 1_000);
            ctx.effects().publish(crate::events::GameModeSelected { mode: "x".into() });
            let missing: Option<u32> = None;
            let _ = missing.expect("reward table row");
            Ok(())
        }
    }

    fn dispatch<'a>(record: &'a PlayerRecord, session: &'a SessionState, config: &'a GameConfig, access: AccessLevel) -> Dispatch<'a> {
        Dispatch { player: record.id, access, record, session, values: None, config }
    }

    #[tokio::test]
    async fn test_success_returns_working_copy_and_events() {
        let record = PlayerRecord::new(PlayerId::from_seed(1));
        let (session, config) = (SessionState::default(), GameConfig::default());
        let command = CompleteMilestone { milestone: Milestone::Intro };

        let applied = execute_atomically(&command, dispatch(&record, &session, &config, AccessLevel::Player))
            .await
            .unwrap();

        assert!(applied.record.tutorial.completed.contains(&Milestone::Intro));
        assert!(record.tutorial.completed.is_empty());
        assert_eq!(applied.events.len(), 2);
    }

    #[tokio::test]
    async fn test_domain_error_discards_everything() {
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        record.tutorial.completed.insert(Milestone::Intro);
        let (session, config) = (SessionState::default(), GameConfig::default());
        let command = CompleteMilestone { milestone: Milestone::Intro };

        let result = execute_atomically(&command, dispatch(&record, &session, &config, AccessLevel::Player)).await;
        assert!(matches!(result, Err(ExecutionFailure::Domain(DomainError::AlreadyCompleted(_)))));
    }

    #[tokio::test]
    async fn test_panic_leaves_no_partial_effects() {
        let record = PlayerRecord::new(PlayerId::from_seed(1));
        let (session, config) = (SessionState::default(), GameConfig::default());

        let result = execute_atomically(&HalfWay {}, dispatch(&record, &session, &config, AccessLevel::Player)).await;
        match result {
            Err(ExecutionFailure::Panicked(message)) => assert!(message.contains("reward table row")),
            other => panic!("expected panic failure, got {:?}", other.map(|a| a.events.len())),
        }
        assert_eq!(record.balance(Currency::Gems), 0);
    }

    #[tokio::test]
    async fn test_raw_access_requires_admin() {
        let record = PlayerRecord::new(PlayerId::from_seed(1));
        let (session, config) = (SessionState::default(), GameConfig::default());
        let command = ForceCorrectRecord {
            target: record.id,
            section: "profile".into(),
            value: r#"{"level":5,"xp":0,"trophies":0}"#.into(),
        };

        let denied = execute_atomically(&command, dispatch(&record, &session, &config, AccessLevel::Player)).await;
        assert!(matches!(denied, Err(ExecutionFailure::Domain(DomainError::RawAccessDenied))));

        let applied = execute_atomically(&command, dispatch(&record, &session, &config, AccessLevel::Admin))
            .await
            .unwrap();
        assert_eq!(applied.record.profile.level, 5);
    }
}
