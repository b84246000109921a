//! Backend and client configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment, used by environment-locked command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        };
        f.write_str(name)
    }
}

/// `major.minor.patch` client build version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ClientVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ClientVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |name: &str| -> Result<u32, String> {
            match parts.next() {
                None | Some("") => Ok(0),
                Some(p) => p
                    .parse()
                    .map_err(|_| format!("invalid {} component in '{}'", name, s)),
            }
        };
        let version = Self::new(next("major")?, next("minor")?, next("patch")?);
        if s.trim().is_empty() {
            return Err("empty version".to_string());
        }
        Ok(version)
    }
}

impl TryFrom<String> for ClientVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientVersion> for String {
    fn from(version: ClientVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How many structurally-agreeing submissions resolve an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Strict majority of currently-connected participants
    Majority,
    /// Every currently-connected participant
    AllConnected,
    /// A fixed count, regardless of connectivity
    Fixed(usize),
}

impl QuorumPolicy {
    /// Required agreeing submissions given `connected` participants.
    pub fn required(&self, connected: usize) -> usize {
        match self {
            Self::Majority => connected / 2 + 1,
            Self::AllConnected => connected.max(1),
            Self::Fixed(n) => (*n).max(1),
        }
    }
}

/// Consensus resolver tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub quorum: QuorumPolicy,

    /// Resolution window measured from the first submission
    pub window_ms: u64,

    /// Upper bound on simultaneously pending actions
    pub max_pending: usize,

    /// How long resolved/failed markers answer late submissions
    pub retention_ms: u64,
}

impl ConsensusConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn with_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = window_ms;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum: QuorumPolicy::Majority,
            window_ms: 5_000,
            max_pending: 1_024,
            retention_ms: 60_000,
        }
    }
}

/// Authoritative backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub environment: Environment,

    /// Lets every caller through the access gate (local testing only)
    pub development_mode: bool,

    pub min_client_version: ClientVersion,

    /// Version of the game configuration the backend runs
    pub config_version: u64,

    pub consensus: ConsensusConfig,
}

impl BackendConfig {
    /// Parses a JSON configuration document; missing keys keep defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_development_mode(mut self, enabled: bool) -> Self {
        self.development_mode = enabled;
        self
    }

    pub fn with_min_client_version(mut self, version: ClientVersion) -> Self {
        self.min_client_version = version;
        self
    }

    pub fn with_config_version(mut self, version: u64) -> Self {
        self.config_version = version;
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Production,
            development_mode: false,
            min_client_version: ClientVersion::new(1, 0, 0),
            config_version: 1,
            consensus: ConsensusConfig::default(),
        }
    }
}

/// Optimistic client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_version: ClientVersion,

    /// Configuration version bundled with the client
    pub config_version: u64,

    /// Submission attempts per command before resynchronizing
    pub max_attempts: u32,

    /// Base backoff between attempts, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

impl ClientConfig {
    pub fn with_client_version(mut self, version: ClientVersion) -> Self {
        self.client_version = version;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_version: ClientVersion::new(1, 0, 0),
            config_version: 1,
            max_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_quorum() {
        assert_eq!(QuorumPolicy::Majority.required(3), 2);
        assert_eq!(QuorumPolicy::Majority.required(4), 3);
        assert_eq!(QuorumPolicy::Majority.required(1), 1);
        assert_eq!(QuorumPolicy::AllConnected.required(4), 4);
        assert_eq!(QuorumPolicy::Fixed(2).required(10), 2);
    }

    #[test]
    fn test_client_version_ordering() {
        let old: ClientVersion = "1.2.9".parse().unwrap();
        let new: ClientVersion = "1.10.0".parse().unwrap();
        assert!(old < new);
        assert_eq!("2".parse::<ClientVersion>().unwrap(), ClientVersion::new(2, 0, 0));
        assert!("one.two".parse::<ClientVersion>().is_err());
        assert!("".parse::<ClientVersion>().is_err());
    }

    #[test]
    fn test_backend_config_from_partial_json() {
        let config = BackendConfig::from_json(
            r#"{ "environment": "development", "min_client_version": "1.4.0",
                 "consensus": { "quorum": { "fixed": 3 } } }"#,
        )
        .unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.min_client_version, ClientVersion::new(1, 4, 0));
        assert_eq!(config.consensus.quorum, QuorumPolicy::Fixed(3));
        assert_eq!(config.consensus.window_ms, 5_000);
        assert!(!config.development_mode);
    }
}
