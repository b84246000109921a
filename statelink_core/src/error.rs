//! Error taxonomy for command dispatch.
//!
//! `DomainError` is the expected, non-fatal outcome of a violated business
//! invariant. Everything else in `DispatchError` describes why a submission
//! never reached (or never finished) a command's `execute`.

use statelink_env::{ActionId, EnvError, MatchId, PlayerId, SessionId};
use thiserror::Error;

/// Violated business invariant raised by a command or a logic mutator.
///
/// Raising one never leaves a partial mutation behind: the dispatcher drops
/// the working copy of the record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Already owned: {0}")]
    AlreadyOwned(String),

    #[error("Already equipped: {0}")]
    AlreadyEquipped(String),

    #[error("Not owned: {0}")]
    NotOwned(String),

    #[error("Unknown item: {0}")]
    UnknownItem(String),

    #[error("Insufficient {currency}: need {needed}, have {available}")]
    InsufficientFunds {
        currency: String,
        needed: u64,
        available: u64,
    },

    #[error("Nothing to claim")]
    NothingToClaim,

    #[error("Match {0} already settled")]
    AlreadySettled(MatchId),

    #[error("Removal from match {0} already applied")]
    AlreadyRemoved(MatchId),

    #[error("Receipt {0} already consumed")]
    ReceiptConsumed(String),

    #[error("Record already at schema version {0}")]
    UpToDate(u32),

    #[error("Unchanged: {0}")]
    Unchanged(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Raw record access requires Admin level")]
    RawAccessDenied,
}

impl DomainError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Field bag encode/decode failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("Value must encode to a struct, got {0}")]
    NotAStruct(String),

    #[error("Malformed field {field}: {reason}")]
    Malformed { field: String, reason: String },

    #[error("Missing field: {0}")]
    Missing(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Capability check failure. Raised before any mutator runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Access denied for {command}: {reason}")]
pub struct AccessDenied {
    pub command: String,
    pub reason: String,
}

impl AccessDenied {
    pub fn new(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Identity proof rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Identity proof missing")]
    Missing,

    #[error("Malformed identity proof: {0}")]
    Malformed(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Proof from session {presented} is not the current session of {player}")]
    StaleSession {
        player: PlayerId,
        presented: SessionId,
    },

    #[error("Proof signed for {signer}, submitted by {submitter}")]
    WrongParticipant { signer: PlayerId, submitter: PlayerId },

    #[error("Proof key is not bound to the session")]
    UnknownKey,
}

/// Consensus resolver failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Consensus window elapsed for {0}")]
    Timeout(ActionId),

    #[error("Submissions for {0} diverged; no group can reach quorum")]
    Divergence(ActionId),

    #[error("Action {0} already failed")]
    AlreadyFailed(ActionId),

    #[error("Too many pending actions ({0})")]
    Capacity(usize),

    #[error("Unknown match {0}")]
    UnknownMatch(MatchId),

    #[error("{player} is not a connected participant of {match_id}")]
    NotAParticipant { player: PlayerId, match_id: MatchId },

    #[error("Vote targets {player}, who is not in {match_id}")]
    TargetNotInMatch { player: PlayerId, match_id: MatchId },
}

/// Record store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt record for {player}: {reason}")]
    Corrupt { player: PlayerId, reason: String },
}

/// Everything that can stop a submission on the backend.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("Domain invariant violated: {0}")]
    Domain(#[from] DomainError),

    #[error("Consensus timed out for {0}")]
    ConsensusTimeout(ActionId),

    #[error("Consensus diverged for {0}")]
    ConsensusDivergence(ActionId),

    #[error("Consensus rejected: {0}")]
    Consensus(ConsensusError),

    #[error("Identity proof rejected: {0}")]
    Proof(#[from] ProofError),

    #[error("Transport failure: {0}")]
    Transport(#[from] EnvError),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Invalid fields: {0}")]
    Fields(#[from] FieldError),

    #[error("Command out of order: {timestamp_ms} is older than {last_ms}")]
    OutOfOrder { timestamp_ms: u64, last_ms: u64 },

    #[error("Client version {client} is below minimum {minimum}")]
    OutdatedClient { client: String, minimum: String },

    #[error("{0} only runs during session initialization")]
    InitializationOnly(String),

    #[error("{0} has no remote authority")]
    LocalOnly(String),

    #[error("No trusted source for {0}")]
    NoTrustedSource(String),

    #[error("No open session for {0}")]
    SessionNotOpen(PlayerId),

    #[error("Record not found: {0}")]
    RecordNotFound(PlayerId),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<ConsensusError> for DispatchError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::Timeout(action) => Self::ConsensusTimeout(action),
            ConsensusError::Divergence(action) => Self::ConsensusDivergence(action),
            other => Self::Consensus(other),
        }
    }
}

impl DispatchError {
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccessDenied(_) => "access_denied",
            Self::Domain(_) => "domain_invariant_violation",
            Self::ConsensusTimeout(_) => "consensus_timeout",
            Self::ConsensusDivergence(_) => "consensus_divergence",
            Self::Consensus(_) => "consensus_rejected",
            Self::Proof(_) => "invalid_proof",
            Self::Transport(_) => "transport_failure",
            Self::Unexpected(_) => "unexpected",
            Self::UnknownCommand(_) => "unknown_command",
            Self::Fields(_) => "invalid_fields",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::OutdatedClient { .. } => "outdated_client",
            Self::InitializationOnly(_) => "initialization_only",
            Self::LocalOnly(_) => "local_only",
            Self::NoTrustedSource(_) => "no_trusted_source",
            Self::SessionNotOpen(_) => "session_not_open",
            Self::RecordNotFound(_) => "record_not_found",
            Self::Storage(_) => "storage",
        }
    }

    /// Message safe to hand to a client. Unexpected failures stay generic.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unexpected(_) | Self::Storage(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Client-side failures of optimistic execution and submission.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClientError {
    #[error("Domain invariant violated: {0}")]
    Domain(#[from] DomainError),

    #[error("{0} only runs on the backend")]
    ServerOnly(String),

    #[error("{command} cannot be executed as {requested}")]
    WrongMode { command: String, requested: String },

    #[error("Invalid fields: {0}")]
    Fields(#[from] FieldError),

    #[error("Transport failure: {0}")]
    Transport(#[from] EnvError),

    #[error("Backend rejected {command}: {code}")]
    Rejected { command: String, code: String },

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}
