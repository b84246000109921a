//! Execution Router.
//!
//! Decides from a command type's execution mode which authority handles a
//! submission, both on the backend (`route`) and on the client
//! (`local_route`).

use crate::command::{CommandMetadata, ExecutionMode};
use crate::error::DispatchError;

/// Backend handling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Execute the submitted command as-is
    Direct,
    /// Rebuild the command from a trusted frame
    FrameDerived,
    /// Buffer until a quorum of participants agrees
    Consensus,
}

/// Client handling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRoute {
    /// Cannot be executed by a client
    Refuse,
    /// Execute locally against session state; never submitted
    SessionOnly,
    /// Execute against the cache, then submit for authoritative replay
    Optimistic,
    /// Derive from the local frame, execute, submit the trigger
    Derived,
}

/// How a simulation-authoritative type can be made trustworthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub frame_derived: bool,
    pub consensus: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionRouter;

impl ExecutionRouter {
    pub fn new() -> Self {
        Self
    }

    /// Backend route for a submission.
    ///
    /// Simulation-authoritative types prefer a trusted snapshot and fall
    /// back to consensus; with neither available the submission is refused.
    pub fn route(
        &self,
        meta: &CommandMetadata,
        capabilities: Capabilities,
        snapshot_reachable: bool,
    ) -> Result<Route, DispatchError> {
        match meta.mode {
            ExecutionMode::Initialization => Err(DispatchError::InitializationOnly(meta.type_tag.to_string())),
            ExecutionMode::LocalOnly => Err(DispatchError::LocalOnly(meta.type_tag.to_string())),
            ExecutionMode::ServerAuthoritative => Ok(Route::Direct),
            ExecutionMode::SimulationAuthoritative => {
                if capabilities.frame_derived && snapshot_reachable {
                    Ok(Route::FrameDerived)
                } else if capabilities.consensus {
                    Ok(Route::Consensus)
                } else {
                    Err(DispatchError::NoTrustedSource(meta.type_tag.to_string()))
                }
            }
        }
    }

    pub fn local_route(&self, meta: &CommandMetadata) -> LocalRoute {
        match meta.mode {
            ExecutionMode::Initialization => LocalRoute::Refuse,
            ExecutionMode::LocalOnly => LocalRoute::SessionOnly,
            ExecutionMode::ServerAuthoritative => LocalRoute::Optimistic,
            ExecutionMode::SimulationAuthoritative => LocalRoute::Derived,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AccessLevel, GameCommand};
    use crate::commands::{CompleteMilestone, EndOfMatchRewards, SanitizeRecord, SelectGameMode};

    const FRAME: Capabilities = Capabilities { frame_derived: true, consensus: false };
    const VOTE: Capabilities = Capabilities { frame_derived: false, consensus: true };

    #[test]
    fn test_server_authoritative_is_direct() {
        let router = ExecutionRouter::new();
        assert_eq!(router.route(&CompleteMilestone::METADATA, Capabilities::default(), false), Ok(Route::Direct));
        assert_eq!(router.local_route(&CompleteMilestone::METADATA), LocalRoute::Optimistic);
    }

    #[test]
    fn test_initialization_and_local_only_refused() {
        let router = ExecutionRouter::new();
        let err = router.route(&SanitizeRecord::METADATA, Capabilities::default(), false).unwrap_err();
        assert_eq!(err.code(), "initialization_only");
        let err = router.route(&SelectGameMode::METADATA, Capabilities::default(), false).unwrap_err();
        assert_eq!(err.code(), "local_only");

        assert_eq!(router.local_route(&SanitizeRecord::METADATA), LocalRoute::Refuse);
        assert_eq!(router.local_route(&SelectGameMode::METADATA), LocalRoute::SessionOnly);
    }

    #[test]
    fn test_simulation_prefers_snapshot() {
        let router = ExecutionRouter::new();
        let meta = EndOfMatchRewards::METADATA;
        let both = Capabilities { frame_derived: true, consensus: true };

        assert_eq!(router.route(&meta, both, true), Ok(Route::FrameDerived));
        assert_eq!(router.route(&meta, both, false), Ok(Route::Consensus));
        assert_eq!(router.route(&meta, VOTE, true), Ok(Route::Consensus));
        assert_eq!(router.route(&meta, FRAME, false).unwrap_err().code(), "no_trusted_source");
    }

    #[test]
    fn test_mode_not_access_decides_route() {
        let meta = CommandMetadata::new("audit_record", AccessLevel::Admin, ExecutionMode::SimulationAuthoritative);
        assert_eq!(ExecutionRouter::new().route(&meta, VOTE, false), Ok(Route::Consensus));
    }
}
