//! Command model: typed commands, their per-type metadata and the erased
//! form the dispatch table works with.

use crate::codec::encode_fields;
use crate::config::Environment;
use crate::context::ExecutionContext;
use crate::error::{DomainError, FieldError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use statelink_env::{FieldBag, PlayerId};
use std::any::Any;
use std::fmt;

/// Capability a caller needs to submit a command type.
///
/// Ordered: `Player < Service < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Player,
    Service,
    Admin,
}

/// Where authoritative work for a command type happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Backend-only, once per session before anything else
    Initialization,
    /// Optimistic on the client, re-executed on the backend
    ServerAuthoritative,
    /// Values come from a trusted frame or from participant consensus
    SimulationAuthoritative,
    /// Ephemeral client session state only
    LocalOnly,
}

/// Static declaration colocated with each command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMetadata {
    pub type_tag: &'static str,
    pub access: AccessLevel,
    pub mode: ExecutionMode,
    /// Environments the type may run in; empty means all
    pub environments: &'static [Environment],
}

impl CommandMetadata {
    pub const fn new(type_tag: &'static str, access: AccessLevel, mode: ExecutionMode) -> Self {
        Self {
            type_tag,
            access,
            mode,
            environments: &[],
        }
    }

    /// Restricts the type to the given environments.
    pub const fn only_in(self, environments: &'static [Environment]) -> Self {
        Self {
            environments,
            ..self
        }
    }

    pub fn allowed_in(&self, environment: Environment) -> bool {
        self.environments.is_empty() || self.environments.contains(&environment)
    }
}

/// A typed, serializable description of an intended mutation.
///
/// `execute` must check its precondition against the record first and
/// raise a `DomainError` instead of mutating when it already holds; that
/// makes blind retries of a whole command safe.
#[async_trait]
pub trait GameCommand: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const METADATA: CommandMetadata;

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError>;

    /// Record this command mutates; `None` means the caller's own.
    fn target(&self) -> Option<PlayerId> {
        None
    }
}

/// Type-erased command as held by the dispatch table.
#[async_trait]
pub trait AnyCommand: fmt::Debug + Send + Sync {
    fn metadata(&self) -> CommandMetadata;

    async fn execute_any(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError>;

    fn encode(&self) -> Result<FieldBag, FieldError>;

    fn target_record(&self) -> Option<PlayerId>;

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<C: GameCommand> AnyCommand for C {
    fn metadata(&self) -> CommandMetadata {
        C::METADATA
    }

    async fn execute_any(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        GameCommand::execute(self, ctx).await
    }

    fn encode(&self) -> Result<FieldBag, FieldError> {
        encode_fields(self)
    }

    fn target_record(&self) -> Option<PlayerId> {
        GameCommand::target(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CompleteMilestone, ForceCorrectRecord, UnlockAllMilestones};
    use crate::record::Milestone;

    #[test]
    fn test_access_ordering() {
        assert!(AccessLevel::Player < AccessLevel::Service);
        assert!(AccessLevel::Service < AccessLevel::Admin);
    }

    #[test]
    fn test_metadata_is_per_type() {
        let a: Box<dyn AnyCommand> = Box::new(CompleteMilestone { milestone: Milestone::Intro });
        let b: Box<dyn AnyCommand> = Box::new(CompleteMilestone { milestone: Milestone::FirstWin });
        assert_eq!(a.metadata(), b.metadata());
        assert_eq!(a.metadata(), CompleteMilestone::METADATA);
    }

    #[test]
    fn test_environment_lock() {
        let meta = UnlockAllMilestones::METADATA;
        assert!(meta.allowed_in(Environment::Development));
        assert!(!meta.allowed_in(Environment::Production));
        assert!(CompleteMilestone::METADATA.allowed_in(Environment::Production));
    }

    #[test]
    fn test_erased_encode_and_target() {
        let target = PlayerId::from_seed(9);
        let command: Box<dyn AnyCommand> = Box::new(ForceCorrectRecord {
            target,
            section: "profile".into(),
            value: "{}".into(),
        });

        assert_eq!(command.target_record(), Some(target));
        let fields = command.encode().unwrap();
        assert_eq!(fields["section"], "\"profile\"");
        assert!(command.as_any().downcast_ref::<ForceCorrectRecord>().is_some());
    }
}
