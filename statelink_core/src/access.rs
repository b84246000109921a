//! Access Gate.
//!
//! Verifies a caller holds the access level a command type declares before
//! anything else runs. Player level needs nothing beyond an open session;
//! Service level needs the internal channel plus a Service credential;
//! Admin level needs an Admin credential. Environment-locked types are
//! refused outside their environments regardless of level.

use crate::command::{AccessLevel, CommandMetadata};
use crate::config::Environment;
use crate::error::AccessDenied;
use crate::trust::CredentialAuthority;
use statelink_env::{Channel, PlayerId};
use tracing::warn;

/// Who is submitting, and through which channel.
#[derive(Debug, Clone, Copy)]
pub struct Caller<'a> {
    pub player: PlayerId,
    pub channel: Channel,
    pub credentials: Option<&'a [u8]>,
}

/// Proof that a caller passed the gate for one command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub command: &'static str,
    pub level: AccessLevel,
    pub caller: PlayerId,
    /// Granted through a verified credential or the development bypass
    pub elevated: bool,
}

impl Grant {
    /// Player-level grants only cover the caller's own record.
    pub fn check_target(&self, target: Option<PlayerId>) -> Result<PlayerId, AccessDenied> {
        match target {
            None => Ok(self.caller),
            Some(target) if target == self.caller || self.elevated => Ok(target),
            Some(_) => Err(AccessDenied::new(
                self.command,
                "player-level commands may only target the caller's record",
            )),
        }
    }
}

pub struct AccessGate {
    authority: CredentialAuthority,
    environment: Environment,
    development_mode: bool,
}

impl AccessGate {
    pub fn new(authority: CredentialAuthority, environment: Environment) -> Self {
        Self {
            authority,
            environment,
            development_mode: false,
        }
    }

    /// Lets every caller through every level outside production.
    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn authorize(&self, meta: &CommandMetadata, caller: &Caller<'_>) -> Result<Grant, AccessDenied> {
        if !meta.allowed_in(self.environment) {
            return Err(AccessDenied::new(
                meta.type_tag,
                format!("not available in {}", self.environment),
            ));
        }

        let grant = |elevated| Grant {
            command: meta.type_tag,
            level: meta.access,
            caller: caller.player,
            elevated,
        };

        if self.development_mode && self.environment != Environment::Production {
            return Ok(grant(meta.access > AccessLevel::Player));
        }

        match meta.access {
            AccessLevel::Player => Ok(grant(false)),
            AccessLevel::Service => {
                if caller.channel != Channel::Internal {
                    warn!(command = meta.type_tag, player = %caller.player, "service command on player channel");
                    return Err(AccessDenied::new(meta.type_tag, "service commands are internal only"));
                }
                self.check_credentials(meta, caller)?;
                Ok(grant(true))
            }
            AccessLevel::Admin => {
                self.check_credentials(meta, caller)?;
                Ok(grant(true))
            }
        }
    }

    fn check_credentials(&self, meta: &CommandMetadata, caller: &Caller<'_>) -> Result<(), AccessDenied> {
        let token = caller
            .credentials
            .ok_or_else(|| AccessDenied::new(meta.type_tag, "missing credentials"))?;
        self.authority.verify_elevated(token, meta.access, meta.type_tag)
    }
}
