//! Common types for the Statelink environment abstraction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Flat string-keyed map carrying a command's fields on the wire.
///
/// Ordered so that two equal bags always serialize identically.
pub type FieldBag = BTreeMap<String, String>;

/// Identifier of a player and of the persisted record the player owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random PlayerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic PlayerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 chars are enough to tell players apart in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of one backend session of a player.
///
/// Identity proofs are scoped to a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SessionId (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.wrapping_mul(0x9e3779b97f4a7c15).to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.to_be_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes, used when signing identity proofs.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of a match of the replicated simulation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchId(pub String);

impl MatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical identity of an action; its effects apply at most once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel a submission arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Player-controlled client connection
    Player,
    /// Trusted backend-internal flow (purchase validation, schedulers)
    Internal,
}

/// Inbound submission: command type tag, field bag, identity/session proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Submitting player (and default target record)
    pub player: PlayerId,

    /// Session the submission belongs to
    pub session: SessionId,

    /// Command type tag
    pub command: String,

    /// Command fields, JSON-encoded per key
    pub fields: FieldBag,

    /// Client clock when the command was created
    pub timestamp_ms: u64,

    /// `major.minor.patch` of the submitting client
    pub client_version: String,

    /// Configuration version the client currently runs
    pub config_version: u64,

    /// Serialized elevated credentials (Admin / Service)
    pub credentials: Option<Vec<u8>>,

    /// Serialized identity proof (consensus submissions)
    pub proof: Option<Vec<u8>>,
}

impl RequestEnvelope {
    /// Creates an envelope without credentials or proof.
    pub fn new(
        player: PlayerId,
        session: SessionId,
        command: impl Into<String>,
        fields: FieldBag,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            player,
            session,
            command: command.into(),
            fields,
            timestamp_ms,
            client_version: String::new(),
            config_version: 0,
            credentials: None,
            proof: None,
        }
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_config_version(mut self, version: u64) -> Self {
        self.config_version = version;
        self
    }

    pub fn with_credentials(mut self, credentials: Vec<u8>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_proof(mut self, proof: Vec<u8>) -> Self {
        self.proof = Some(proof);
        self
    }
}

/// Outcome of a submission as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Mutation applied; `fields` carries the record digests
    Applied,
    /// Accepted without effect (guard or already-resolved action)
    NoOp,
    /// Buffered awaiting consensus
    Pending,
    /// Rejected; see `error_code`
    Rejected,
}

/// Outbound reply to a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub command: String,
    pub status: ResponseStatus,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub fields: FieldBag,
    /// Set when the backend runs a newer configuration than the client
    pub config_version: Option<u64>,
}

impl ResponseEnvelope {
    pub fn new(command: impl Into<String>, status: ResponseStatus) -> Self {
        Self {
            command: command.into(),
            status,
            error_code: None,
            message: None,
            fields: FieldBag::new(),
            config_version: None,
        }
    }

    /// Creates a rejection with a stable error code.
    pub fn rejected(
        command: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_code: Some(code.into()),
            message: Some(message.into()),
            ..Self::new(command, ResponseStatus::Rejected)
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.status == ResponseStatus::Rejected
    }
}

/// Granted when a player opens a backend session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub player: PlayerId,
    pub session: SessionId,
    /// Full authoritative record, one JSON section per key
    pub state: FieldBag,
    pub config_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_from_seed_is_stable() {
        assert_eq!(PlayerId::from_seed(7), PlayerId::from_seed(7));
        assert_ne!(PlayerId::from_seed(7), PlayerId::from_seed(8));
    }

    #[test]
    fn test_request_builder() {
        let request = RequestEnvelope::new(
            PlayerId::from_seed(1),
            SessionId::from_seed(1),
            "complete_milestone",
            FieldBag::new(),
            42,
        )
        .with_client_version("1.2.0")
        .with_proof(vec![1, 2, 3]);

        assert_eq!(request.client_version, "1.2.0");
        assert_eq!(request.proof.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(request.credentials.is_none());
    }

    #[test]
    fn test_rejected_response() {
        let response = ResponseEnvelope::rejected("equip_item", "access_denied", "nope");
        assert!(response.is_rejected());
        assert_eq!(response.error_code.as_deref(), Some("access_denied"));
    }
}
