//! Persisted player record and its per-section state digests.

use crate::codec::{decode_fields, encode_fields};
use crate::error::{DomainError, FieldError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use statelink_env::{FieldBag, MatchId, PlayerId};
use std::collections::{BTreeMap, BTreeSet};

/// Schema version written by the current `sanitize_record` migration.
pub const SCHEMA_VERSION: u32 = 2;

/// Sections excluded from digests: identity and bookkeeping.
const UNDIGESTED: [&str; 2] = ["id", "meta"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Coins,
    Gems,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coins => f.write_str("coins"),
            Self::Gems => f.write_str("gems"),
        }
    }
}

/// Tutorial milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Milestone {
    Intro,
    FirstMatch,
    Loadout,
    FirstWin,
}

impl Milestone {
    pub const ALL: [Milestone; 4] = [
        Milestone::Intro,
        Milestone::FirstMatch,
        Milestone::Loadout,
        Milestone::FirstWin,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Weapon,
    Outfit,
    Emote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub level: u32,
    pub xp: u64,
    pub trophies: u32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            level: 1,
            xp: 0,
            trophies: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub owned: BTreeSet<String>,
    pub loadout: BTreeMap<Slot, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub cosmetics: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutorial {
    pub completed: BTreeSet<Milestone>,
}

/// A granted but not yet collected reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub source: String,
    pub currency: Currency,
    pub amount: u64,
}

/// Idempotency keys of one-shot effects.
///
/// Keys are never evicted: a marker that disappears lets its action apply
/// a second time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub settled_matches: BTreeSet<MatchId>,
    pub removals: BTreeSet<MatchId>,
    pub receipts: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub schema_version: u32,

    /// Client timestamp of the last applied player command
    pub last_command_ms: u64,
}

/// The persisted state of one player, owned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub profile: Profile,
    pub currencies: BTreeMap<Currency, u64>,
    pub equipment: Equipment,
    pub collection: Collection,
    pub tutorial: Tutorial,
    pub rewards: Vec<Reward>,
    pub history: History,
    pub meta: RecordMeta,
}

impl PlayerRecord {
    /// Creates an unmigrated record; initialization brings it to `SCHEMA_VERSION`.
    pub fn new(id: PlayerId) -> Self {
        Self {
            id,
            profile: Profile::default(),
            currencies: BTreeMap::new(),
            equipment: Equipment::default(),
            collection: Collection::default(),
            tutorial: Tutorial::default(),
            rewards: Vec::new(),
            history: History::default(),
            meta: RecordMeta::default(),
        }
    }

    pub fn balance(&self, currency: Currency) -> u64 {
        self.currencies.get(&currency).copied().unwrap_or(0)
    }

    /// One JSON section per key.
    pub fn to_fields(&self) -> Result<FieldBag, FieldError> {
        encode_fields(self)
    }

    pub fn from_fields(fields: &FieldBag) -> Result<Self, FieldError> {
        decode_fields(fields)
    }

    /// SHA-256 of every section except identity and bookkeeping.
    pub fn digest(&self) -> StateDigest {
        let mut sections = BTreeMap::new();
        if let Ok(fields) = self.to_fields() {
            for (name, json) in fields {
                if UNDIGESTED.contains(&name.as_str()) {
                    continue;
                }
                let digest = Sha256::digest(json.as_bytes());
                let hex = digest
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>();
                sections.insert(name, hex);
            }
        }
        StateDigest(sections)
    }

    /// Replaces a whole section from its JSON form (Admin force-correction).
    pub(crate) fn replace_section(&mut self, section: &str, json: &str) -> Result<(), DomainError> {
        if UNDIGESTED.contains(&section) {
            return Err(DomainError::invalid(section, "section is not correctable"));
        }
        let mut fields = self
            .to_fields()
            .map_err(|e| DomainError::invalid(section, e.to_string()))?;
        match fields.get_mut(section) {
            Some(current) if current == json => {
                return Err(DomainError::Unchanged(section.to_string()));
            }
            Some(current) => *current = json.to_string(),
            None => return Err(DomainError::invalid(section, "no such section")),
        }
        *self = Self::from_fields(&fields).map_err(|e| DomainError::invalid(section, e.to_string()))?;
        Ok(())
    }
}

/// Per-section hashes used to detect client desync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDigest(pub BTreeMap<String, String>);

impl StateDigest {
    const PREFIX: &'static str = "digest.";

    /// Sections whose hashes differ (or exist on only one side).
    pub fn diverging_sections(&self, other: &StateDigest) -> Vec<String> {
        let names: BTreeSet<&String> = self.0.keys().chain(other.0.keys()).collect();
        names
            .into_iter()
            .filter(|name| self.0.get(*name) != other.0.get(*name))
            .cloned()
            .collect()
    }

    /// Writes the digest into a response field bag.
    pub fn write_into(&self, fields: &mut FieldBag) {
        for (section, hash) in &self.0 {
            fields.insert(format!("{}{}", Self::PREFIX, section), hash.clone());
        }
    }

    /// Reads a digest back out of a response field bag.
    pub fn read_from(fields: &FieldBag) -> Self {
        Self(
            fields
                .iter()
                .filter_map(|(key, hash)| {
                    key.strip_prefix(Self::PREFIX)
                        .map(|section| (section.to_string(), hash.clone()))
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PlayerRecord {
        let mut record = PlayerRecord::new(PlayerId::from_seed(3));
        record.currencies.insert(Currency::Coins, 250);
        record.tutorial.completed.insert(Milestone::Intro);
        record
    }

    #[test]
    fn test_fields_preserve_record() {
        let record = sample();
        let fields = record.to_fields().unwrap();

        assert!(fields.contains_key("currencies"));
        assert_eq!(fields["currencies"], r#"{"coins":250}"#);
        assert_eq!(PlayerRecord::from_fields(&fields).unwrap(), record);
    }

    #[test]
    fn test_digest_pinpoints_changed_section() {
        let before = sample();
        let mut after = before.clone();
        after.currencies.insert(Currency::Coins, 300);
        after.meta.last_command_ms = 99;

        let diff = before.digest().diverging_sections(&after.digest());
        assert_eq!(diff, vec!["currencies".to_string()]);
    }

    #[test]
    fn test_digest_survives_field_bag() {
        let digest = sample().digest();
        let mut fields = FieldBag::new();
        fields.insert("unrelated".into(), "1".into());
        digest.write_into(&mut fields);

        assert_eq!(StateDigest::read_from(&fields), digest);
    }

    #[test]
    fn test_replace_section() {
        let mut record = sample();
        record
            .replace_section("profile", r#"{"level":9,"xp":0,"trophies":40}"#)
            .unwrap();
        assert_eq!(record.profile.level, 9);
        assert_eq!(record.profile.trophies, 40);

        let json = record.to_fields().unwrap()["profile"].clone();
        assert_eq!(
            record.replace_section("profile", &json),
            Err(DomainError::Unchanged("profile".into()))
        );
        assert!(record.replace_section("meta", "{}").is_err());
        assert!(record.replace_section("profile", "not json").is_err());
    }

    #[test]
    fn test_history_survives_round_trip() {
        let mut record = PlayerRecord::new(PlayerId::from_seed(7));
        for i in 0..100 {
            record.history.settled_matches.insert(MatchId::new(format!("m{}", i)));
        }
        record.history.receipts.insert("r-0".to_string());

        let restored = PlayerRecord::from_fields(&record.to_fields().unwrap()).unwrap();
        assert_eq!(restored.history.settled_matches.len(), 100);
        assert!(restored.history.settled_matches.contains(&MatchId::new("m0")));
        assert!(restored.history.receipts.contains("r-0"));
    }
}
