//! Trust layer: session identity proofs and elevated credentials.
//!
//! - `IdentityProof`: Ed25519 signature binding a consensus submission to the
//!   submitting participant's current session
//! - `SessionRegistry`: which session (and which verifying key) is current
//!   for each player; proofs from any other session are stale
//! - `CredentialAuthority`: Biscuit verification for Service and Admin
//!   access levels

use crate::command::AccessLevel;
use crate::error::{AccessDenied, ProofError};
use biscuit_auth::{macros::*, Biscuit, KeyPair, PublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use statelink_env::{ActionId, FieldBag, PlayerId, SessionId};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Credential minting failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Biscuit error: {0}")]
    BiscuitError(String),
}

// ============================================================================
// IDENTITY PROOF
// ============================================================================

/// Signed statement "this participant, in this session, submits these fields
/// for this action".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProof {
    pub player: PlayerId,
    pub session: SessionId,

    #[serde(with = "signature_serde")]
    pub signature: Signature,

    #[serde(with = "verifying_key_serde")]
    pub public_key: VerifyingKey,
}

impl IdentityProof {
    /// Signs a submission with the session key.
    pub fn sign(
        key: &SigningKey,
        player: PlayerId,
        session: SessionId,
        action: &ActionId,
        fields: &FieldBag,
    ) -> Self {
        let message = Self::message(player, session, action, fields);
        Self {
            player,
            session,
            signature: key.sign(&message),
            public_key: key.verifying_key(),
        }
    }

    /// Checks the signature covers exactly this action and field bag.
    pub fn verify_integrity(&self, action: &ActionId, fields: &FieldBag) -> Result<(), ProofError> {
        let message = Self::message(self.player, self.session, action, fields);
        self.public_key
            .verify(&message, &self.signature)
            .map_err(|_| ProofError::InvalidSignature)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing fixed-size byte arrays and uuids cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofError> {
        serde_json::from_slice(bytes).map_err(|e| ProofError::Malformed(e.to_string()))
    }

    fn message(player: PlayerId, session: SessionId, action: &ActionId, fields: &FieldBag) -> Vec<u8> {
        let mut message = Vec::with_capacity(64);
        message.extend_from_slice(player.as_uuid().as_bytes());
        message.extend_from_slice(session.as_bytes());
        message.extend_from_slice(action.as_str().as_bytes());
        message.push(0);
        // BTreeMap serializes in key order
        message.extend(serde_json::to_vec(fields).unwrap_or_default());
        message
    }
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

#[derive(Debug, Clone)]
struct SessionBinding {
    session: SessionId,
    key: Option<VerifyingKey>,
    opened_at: Duration,
}

/// Current session of every connected player.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<PlayerId, SessionBinding>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `session` current for `player`. Returns the retired session.
    pub fn open(
        &mut self,
        player: PlayerId,
        session: SessionId,
        key: Option<VerifyingKey>,
        now: Duration,
    ) -> Option<SessionId> {
        self.sessions
            .insert(player, SessionBinding { session, key, opened_at: now })
            .map(|old| old.session)
    }

    pub fn close(&mut self, player: PlayerId) -> Option<SessionId> {
        self.sessions.remove(&player).map(|b| b.session)
    }

    pub fn current(&self, player: PlayerId) -> Option<SessionId> {
        self.sessions.get(&player).map(|b| b.session)
    }

    pub fn is_current(&self, player: PlayerId, session: SessionId) -> bool {
        self.current(player) == Some(session)
    }

    /// Time the current session of `player` was opened.
    pub fn opened_at(&self, player: PlayerId) -> Option<Duration> {
        self.sessions.get(&player).map(|b| b.opened_at)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Full proof check for a consensus submission.
    ///
    /// 1. The proof names the submitter
    /// 2. The proof's session is the submitter's current session
    /// 3. The proof key is the one bound when that session opened
    /// 4. The signature covers the action and fields
    pub fn verify(
        &self,
        proof: &IdentityProof,
        submitter: PlayerId,
        action: &ActionId,
        fields: &FieldBag,
    ) -> Result<(), ProofError> {
        if proof.player != submitter {
            return Err(ProofError::WrongParticipant {
                signer: proof.player,
                submitter,
            });
        }

        let binding = self
            .sessions
            .get(&submitter)
            .filter(|b| b.session == proof.session)
            .ok_or(ProofError::StaleSession {
                player: submitter,
                presented: proof.session,
            })?;

        match binding.key {
            Some(key) if key == proof.public_key => {}
            _ => return Err(ProofError::UnknownKey),
        }

        proof.verify_integrity(action, fields)
    }
}

// ============================================================================
// ELEVATED CREDENTIALS
// ============================================================================

/// Verifies Biscuit tokens minted by the backend's root authority.
#[derive(Clone)]
pub struct CredentialAuthority {
    root_public_key: PublicKey,
}

impl CredentialAuthority {
    pub fn new(root_public_key: PublicKey) -> Self {
        Self { root_public_key }
    }

    /// Checks `token_bytes` grants `level` for `command`.
    ///
    /// Admin tokens satisfy every level; Service tokens only Service.
    pub fn verify_elevated(
        &self,
        token_bytes: &[u8],
        level: AccessLevel,
        command: &str,
    ) -> Result<(), AccessDenied> {
        let biscuit = Biscuit::from(token_bytes, self.root_public_key)
            .map_err(|e| AccessDenied::new(command, format!("invalid token: {:?}", e)))?;

        let mut authorizer = biscuit
            .authorizer()
            .map_err(|e| AccessDenied::new(command, format!("{:?}", e)))?;

        let level = match level {
            AccessLevel::Player => "player",
            AccessLevel::Service => "service",
            AccessLevel::Admin => "admin",
        };
        authorizer
            .add_fact(fact!("command({command})"))
            .map_err(|e| AccessDenied::new(command, format!("{:?}", e)))?;
        authorizer
            .add_fact(fact!("level({level})"))
            .map_err(|e| AccessDenied::new(command, format!("{:?}", e)))?;

        authorizer
            .add_policy("allow if right(\"admin\")")
            .map_err(|e| AccessDenied::new(command, format!("{:?}", e)))?;
        authorizer
            .add_policy("allow if right(\"service\"), level(\"service\")")
            .map_err(|e| AccessDenied::new(command, format!("{:?}", e)))?;

        authorizer
            .authorize()
            .map_err(|_| AccessDenied::new(command, format!("credentials do not grant {} level", level)))?;

        Ok(())
    }
}

/// Mints elevated credentials (operator tooling and tests).
pub struct TokenFactory {
    root_keypair: KeyPair,
}

impl TokenFactory {
    pub fn new(root_keypair: KeyPair) -> Self {
        Self { root_keypair }
    }

    pub fn authority(&self) -> CredentialAuthority {
        CredentialAuthority::new(self.root_keypair.public())
    }

    pub fn create_admin_token(&self) -> Result<Vec<u8>, CredentialError> {
        let biscuit = biscuit!(
            r#"
            right("admin");
        "#
        )
        .build(&self.root_keypair)
        .map_err(|e| CredentialError::BiscuitError(format!("{:?}", e)))?;

        biscuit
            .to_vec()
            .map_err(|e| CredentialError::BiscuitError(format!("{:?}", e)))
    }

    /// Service token, optionally restricted to a set of command types.
    pub fn create_service_token(&self, command_prefix: &str) -> Result<Vec<u8>, CredentialError> {
        let biscuit = biscuit!(
            r#"
            right("service");
            check if command($cmd), $cmd.starts_with({command_prefix});
        "#
        )
        .build(&self.root_keypair)
        .map_err(|e| CredentialError::BiscuitError(format!("{:?}", e)))?;

        biscuit
            .to_vec()
            .map_err(|e| CredentialError::BiscuitError(format!("{:?}", e)))
    }
}

mod signature_serde {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        sig.to_bytes().to_vec().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

mod verifying_key_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
