//! Narrow per-domain mutators over a player record.
//!
//! Commands never touch `PlayerRecord` fields directly; they go through one
//! of these surfaces, each returning a result or raising a `DomainError`.

use crate::error::DomainError;
use crate::record::{Currency, Milestone, PlayerRecord, Reward, Slot};
use serde::{Deserialize, Serialize};
use statelink_env::MatchId;
use std::collections::{BTreeMap, BTreeSet};

/// A purchasable catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub slot: Slot,
    pub currency: Currency,
    pub price: u64,
}

/// Rewards for one match result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRewards {
    pub coins: u64,
    pub xp: u64,
    pub trophy_delta: i64,
}

/// Opaque gameplay tables consumed by the mutators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub starter_coins: u64,
    pub milestone_rewards: BTreeMap<Milestone, u64>,
    pub catalog: BTreeMap<String, CatalogItem>,
    /// In-app products: what a validated receipt grants
    pub products: BTreeMap<String, BTreeMap<Currency, u64>>,
    /// Coins by placement, 1st place first
    pub placement_coins: Vec<u64>,
    pub coins_per_kill: u64,
    pub xp_per_match: u64,
    pub xp_per_level: u64,
    /// Ranked trophy change by placement, 1st place first
    pub ranked_trophies: Vec<i64>,
    pub removal_trophy_penalty: i64,
}

impl Default for GameConfig {
    fn default() -> Self {
        let milestone_rewards = Milestone::ALL
            .iter()
            .zip([100, 50, 50, 200])
            .map(|(m, coins)| (*m, coins))
            .collect();

        let mut catalog = BTreeMap::new();
        catalog.insert(
            "blaster".to_string(),
            CatalogItem { slot: Slot::Weapon, currency: Currency::Coins, price: 300 },
        );
        catalog.insert(
            "ninja_suit".to_string(),
            CatalogItem { slot: Slot::Outfit, currency: Currency::Gems, price: 20 },
        );
        catalog.insert(
            "wave".to_string(),
            CatalogItem { slot: Slot::Emote, currency: Currency::Coins, price: 50 },
        );

        let mut products = BTreeMap::new();
        products.insert(
            "gem_pack_small".to_string(),
            [(Currency::Gems, 50)].into_iter().collect(),
        );

        Self {
            starter_coins: 200,
            milestone_rewards,
            catalog,
            products,
            placement_coins: vec![120, 80, 50, 30],
            coins_per_kill: 10,
            xp_per_match: 40,
            xp_per_level: 100,
            ranked_trophies: vec![30, 15, -5, -10],
            removal_trophy_penalty: 25,
        }
    }
}

/// Entry point to every mutator surface of one record.
pub struct GameLogic<'a> {
    record: &'a mut PlayerRecord,
    config: &'a GameConfig,
}

impl<'a> GameLogic<'a> {
    pub(crate) fn new(record: &'a mut PlayerRecord, config: &'a GameConfig) -> Self {
        Self { record, config }
    }

    pub fn config(&self) -> &GameConfig {
        self.config
    }

    pub fn currency(&mut self) -> CurrencyLogic<'_> {
        CurrencyLogic { record: &mut *self.record }
    }

    pub fn equipment(&mut self) -> EquipmentLogic<'_> {
        EquipmentLogic { record: &mut *self.record }
    }

    pub fn collection(&mut self) -> CollectionLogic<'_> {
        CollectionLogic { record: &mut *self.record }
    }

    pub fn tutorial(&mut self) -> TutorialLogic<'_> {
        TutorialLogic { record: &mut *self.record }
    }

    pub fn progression(&mut self) -> ProgressionLogic<'_> {
        ProgressionLogic { record: &mut *self.record, config: self.config }
    }

    pub fn rewards(&mut self) -> RewardLogic<'_> {
        RewardLogic { record: &mut *self.record, config: self.config }
    }

    pub fn history(&mut self) -> HistoryLogic<'_> {
        HistoryLogic { record: &mut *self.record }
    }

    pub fn maintenance(&mut self) -> MaintenanceLogic<'_> {
        MaintenanceLogic { record: &mut *self.record }
    }

    pub(crate) fn raw(&mut self) -> RawRecordAccess<'_> {
        RawRecordAccess { record: &mut *self.record }
    }
}

pub struct CurrencyLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl CurrencyLogic<'_> {
    pub fn balance(&self, currency: Currency) -> u64 {
        self.record.balance(currency)
    }

    /// Adds to a balance and returns the new balance.
    pub fn credit(&mut self, currency: Currency, amount: u64) -> u64 {
        let balance = self.record.currencies.entry(currency).or_insert(0);
        *balance = balance.saturating_add(amount);
        *balance
    }

    /// Removes from a balance; never goes negative.
    pub fn debit(&mut self, currency: Currency, amount: u64) -> Result<u64, DomainError> {
        let available = self.balance(currency);
        if available < amount {
            return Err(DomainError::InsufficientFunds {
                currency: currency.to_string(),
                needed: amount,
                available,
            });
        }
        let remaining = available - amount;
        self.record.currencies.insert(currency, remaining);
        Ok(remaining)
    }
}

pub struct EquipmentLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl EquipmentLogic<'_> {
    pub fn owns(&self, item: &str) -> bool {
        self.record.equipment.owned.contains(item)
    }

    pub fn grant(&mut self, item: &str) -> Result<(), DomainError> {
        if !self.record.equipment.owned.insert(item.to_string()) {
            return Err(DomainError::AlreadyOwned(item.to_string()));
        }
        Ok(())
    }

    pub fn equip(&mut self, slot: Slot, item: &str) -> Result<(), DomainError> {
        if !self.owns(item) {
            return Err(DomainError::NotOwned(item.to_string()));
        }
        if self.record.equipment.loadout.get(&slot).map(String::as_str) == Some(item) {
            return Err(DomainError::AlreadyEquipped(item.to_string()));
        }
        self.record.equipment.loadout.insert(slot, item.to_string());
        Ok(())
    }
}

pub struct CollectionLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl CollectionLogic<'_> {
    pub fn has(&self, cosmetic: &str) -> bool {
        self.record.collection.cosmetics.contains(cosmetic)
    }

    /// Returns false when the cosmetic was already collected.
    pub fn add(&mut self, cosmetic: &str) -> bool {
        self.record.collection.cosmetics.insert(cosmetic.to_string())
    }
}

pub struct TutorialLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl TutorialLogic<'_> {
    pub fn is_completed(&self, milestone: Milestone) -> bool {
        self.record.tutorial.completed.contains(&milestone)
    }

    pub fn completed(&self) -> &BTreeSet<Milestone> {
        &self.record.tutorial.completed
    }

    pub fn complete(&mut self, milestone: Milestone) -> Result<(), DomainError> {
        if !self.record.tutorial.completed.insert(milestone) {
            return Err(DomainError::AlreadyCompleted(format!("{:?}", milestone)));
        }
        Ok(())
    }
}

pub struct ProgressionLogic<'r> {
    record: &'r mut PlayerRecord,
    config: &'r GameConfig,
}

impl ProgressionLogic<'_> {
    /// Adds experience and returns the number of levels gained.
    pub fn add_xp(&mut self, xp: u64) -> u32 {
        let per_level = self.config.xp_per_level.max(1);
        let profile = &mut self.record.profile;
        profile.xp = profile.xp.saturating_add(xp);
        let mut gained = 0;
        while profile.xp >= per_level {
            profile.xp -= per_level;
            profile.level += 1;
            gained += 1;
        }
        gained
    }

    /// Applies a trophy change, clamped at zero. Returns the new count.
    pub fn apply_trophies(&mut self, delta: i64) -> u32 {
        let current = i64::from(self.record.profile.trophies);
        let next = (current + delta).clamp(0, i64::from(u32::MAX));
        self.record.profile.trophies = next as u32;
        self.record.profile.trophies
    }
}

pub struct RewardLogic<'r> {
    record: &'r mut PlayerRecord,
    config: &'r GameConfig,
}

impl RewardLogic<'_> {
    /// Rewards for a placement. Ranked matches also move trophies.
    pub fn match_rewards(&self, placement: u32, kills: u32, ranked: bool) -> MatchRewards {
        let index = placement.saturating_sub(1) as usize;
        let placement_coins = self.config.placement_coins.get(index).copied().unwrap_or(0);
        let trophy_delta = if ranked {
            self.config
                .ranked_trophies
                .get(index)
                .or_else(|| self.config.ranked_trophies.last())
                .copied()
                .unwrap_or(0)
        } else {
            0
        };

        MatchRewards {
            coins: placement_coins + u64::from(kills) * self.config.coins_per_kill,
            xp: self.config.xp_per_match,
            trophy_delta,
        }
    }

    /// Queues a reward for later collection.
    pub fn queue(&mut self, reward: Reward) {
        self.record.rewards.push(reward);
    }

    pub fn pending(&self) -> &[Reward] {
        &self.record.rewards
    }

    /// Moves every queued reward into the balances.
    pub fn claim_all(&mut self) -> Result<Vec<Reward>, DomainError> {
        if self.record.rewards.is_empty() {
            return Err(DomainError::NothingToClaim);
        }
        let claimed = std::mem::take(&mut self.record.rewards);
        for reward in &claimed {
            let balance = self.record.currencies.entry(reward.currency).or_insert(0);
            *balance = balance.saturating_add(reward.amount);
        }
        Ok(claimed)
    }
}

pub struct HistoryLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl HistoryLogic<'_> {
    pub fn is_settled(&self, match_id: &MatchId) -> bool {
        self.record.history.settled_matches.contains(match_id)
    }

    pub fn mark_settled(&mut self, match_id: &MatchId) -> Result<(), DomainError> {
        if self.is_settled(match_id) {
            return Err(DomainError::AlreadySettled(match_id.clone()));
        }
        self.record.history.settled_matches.insert(match_id.clone());
        Ok(())
    }

    pub fn mark_removed(&mut self, match_id: &MatchId) -> Result<(), DomainError> {
        if !self.record.history.removals.insert(match_id.clone()) {
            return Err(DomainError::AlreadyRemoved(match_id.clone()));
        }
        Ok(())
    }

    pub fn consume_receipt(&mut self, receipt: &str) -> Result<(), DomainError> {
        if !self.record.history.receipts.insert(receipt.to_string()) {
            return Err(DomainError::ReceiptConsumed(receipt.to_string()));
        }
        Ok(())
    }
}

/// Schema bookkeeping for initialization commands.
pub struct MaintenanceLogic<'r> {
    record: &'r mut PlayerRecord,
}

impl MaintenanceLogic<'_> {
    pub fn schema_version(&self) -> u32 {
        self.record.meta.schema_version
    }

    pub fn set_schema_version(&mut self, version: u32) {
        self.record.meta.schema_version = version;
    }

    /// Drops loadout entries pointing at items the player no longer owns.
    pub fn prune_loadout(&mut self) -> usize {
        let owned = &self.record.equipment.owned;
        let before = self.record.equipment.loadout.len();
        self.record.equipment.loadout.retain(|_, item| owned.contains(item));
        before - self.record.equipment.loadout.len()
    }
}

/// Bulk section access, handed out only to Admin-level commands.
pub struct RawRecordAccess<'r> {
    record: &'r mut PlayerRecord,
}

impl RawRecordAccess<'_> {
    pub fn section(&self, name: &str) -> Option<String> {
        self.record.to_fields().ok()?.get(name).cloned()
    }

    pub fn replace_section(&mut self, name: &str, json: &str) -> Result<(), DomainError> {
        self.record.replace_section(name, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelink_env::PlayerId;

    #[test]
    fn test_debit_never_goes_negative() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let mut logic = GameLogic::new(&mut record, &config);

        logic.currency().credit(Currency::Coins, 40);
        let err = logic.currency().debit(Currency::Coins, 50).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientFunds { currency: "coins".into(), needed: 50, available: 40 }
        );
        assert_eq!(logic.currency().debit(Currency::Coins, 40), Ok(0));
    }

    #[test]
    fn test_xp_rolls_over_levels() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let gained = GameLogic::new(&mut record, &config).progression().add_xp(250);

        assert_eq!(gained, 2);
        assert_eq!(record.profile.level, 3);
        assert_eq!(record.profile.xp, 50);
    }

    #[test]
    fn test_trophies_clamp_at_zero() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let mut logic = GameLogic::new(&mut record, &config);

        assert_eq!(logic.progression().apply_trophies(10), 10);
        assert_eq!(logic.progression().apply_trophies(-25), 0);
    }

    #[test]
    fn test_match_rewards_by_placement() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let mut logic = GameLogic::new(&mut record, &config);
        let rewards = logic.rewards();

        assert_eq!(
            rewards.match_rewards(1, 3, true),
            MatchRewards { coins: 150, xp: 40, trophy_delta: 30 }
        );
        assert_eq!(rewards.match_rewards(4, 0, false).trophy_delta, 0);
        // Placements beyond the table earn no coins but keep the last trophy step
        assert_eq!(
            rewards.match_rewards(9, 0, true),
            MatchRewards { coins: 0, xp: 40, trophy_delta: -10 }
        );
    }

    #[test]
    fn test_claim_all_moves_rewards() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let mut logic = GameLogic::new(&mut record, &config);

        assert_eq!(logic.rewards().claim_all(), Err(DomainError::NothingToClaim));
        logic.rewards().queue(Reward { source: "m1".into(), currency: Currency::Coins, amount: 70 });
        assert_eq!(logic.rewards().claim_all().unwrap().len(), 1);
        assert_eq!(record.balance(Currency::Coins), 70);
        assert!(record.rewards.is_empty());
    }

    #[test]
    fn test_equip_requires_ownership() {
        let config = GameConfig::default();
        let mut record = PlayerRecord::new(PlayerId::from_seed(1));
        let mut logic = GameLogic::new(&mut record, &config);

        assert!(matches!(logic.equipment().equip(Slot::Weapon, "blaster"), Err(DomainError::NotOwned(_))));
        logic.equipment().grant("blaster").unwrap();
        logic.equipment().equip(Slot::Weapon, "blaster").unwrap();
        assert!(matches!(
            logic.equipment().equip(Slot::Weapon, "blaster"),
            Err(DomainError::AlreadyEquipped(_))
        ));
    }
}
