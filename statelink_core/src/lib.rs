//! Statelink Core - Authoritative command replication for multiplayer games
//!
//! Player state changes travel as typed commands. The client runs them
//! optimistically against a local cache; the backend re-runs them against
//! the persisted record and is the only source of truth. The crate covers
//! three ways an action's values can be trusted:
//! 1. **Server-authoritative**: the backend simply re-executes the command
//! 2. **Frame-derived**: the backend rebuilds every field from its own trusted
//!    simulation snapshot and ignores what the client sent
//! 3. **Consensus**: with no trusted snapshot, a quorum of connected match
//!    participants must submit structurally equal, session-signed commands
//!
//! Every command checks its own precondition before mutating, so a retried
//! submission becomes a `DomainError` instead of a second application.

pub mod access;
pub mod backend;
pub mod client;
pub mod codec;
pub mod command;
pub mod commands;
pub mod config;
pub mod consensus;
pub mod context;
pub mod error;
pub mod events;
pub mod frame;
pub mod logic;
pub mod record;
pub mod registry;
pub mod router;
pub mod store;
pub mod transport;
pub mod trust;

// Re-export key types for convenience
pub use access::{AccessGate, Caller, Grant};
pub use backend::{Backend, BackendStats, Dispatched};
pub use client::{ClientSession, ClientStats, CommandQueue, LocalOutcome};
pub use command::{AccessLevel, AnyCommand, CommandMetadata, ExecutionMode, GameCommand};
pub use commands::standard_registry;
pub use config::{BackendConfig, ClientConfig, ClientVersion, ConsensusConfig, Environment, QuorumPolicy};
pub use consensus::{ConsensusCommand, ConsensusResolver, ConsensusVerdict, MatchRoster};
pub use context::{ExecutionContext, SessionState};
pub use error::{
    AccessDenied, ClientError, ConsensusError, DispatchError, DomainError, FieldError, ProofError,
    StoreError,
};
pub use events::{OutcomeBus, OutcomeEvent, PublishReport};
pub use frame::{
    Derivation, FrameDerivationAdapter, FrameDerived, GameSession, MatchFrame, MatchPhase,
    PlacementResult, SimulationValues, SnapshotSource,
};
pub use logic::GameConfig;
pub use record::{PlayerRecord, StateDigest};
pub use registry::CommandRegistry;
pub use router::{ExecutionRouter, Route};
pub use store::{InMemoryRecordStore, RecordStore, SledRecordStore};
pub use transport::LocalTransport;
pub use trust::{CredentialAuthority, IdentityProof, SessionRegistry, TokenFactory};
