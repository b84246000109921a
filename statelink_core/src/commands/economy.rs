use crate::command::{AccessLevel, CommandMetadata, ExecutionMode, GameCommand};
use crate::context::ExecutionContext;
use crate::error::DomainError;
use crate::events::{CurrencyChanged, ItemEquipped, ItemPurchased, PurchaseGranted, RewardsClaimed};
use crate::record::Currency;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Buys a catalog item with its listed currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub item: String,
}

#[async_trait]
impl GameCommand for PurchaseItem {
    const METADATA: CommandMetadata =
        CommandMetadata::new("purchase_item", AccessLevel::Player, ExecutionMode::ServerAuthoritative);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let entry = ctx
            .logic()
            .config()
            .catalog
            .get(&self.item)
            .cloned()
            .ok_or_else(|| DomainError::UnknownItem(self.item.clone()))?;
        if ctx.logic().equipment().owns(&self.item) {
            return Err(DomainError::AlreadyOwned(self.item.clone()));
        }

        let balance = ctx.logic().currency().debit(entry.currency, entry.price)?;
        ctx.logic().equipment().grant(&self.item)?;

        let player = ctx.player();
        ctx.effects().publish(CurrencyChanged {
            player,
            currency: entry.currency,
            delta: -(entry.price as i64),
            balance,
        });
        ctx.effects().publish(ItemPurchased {
            player,
            item: self.item.clone(),
        });
        Ok(())
    }
}

/// Puts an owned item into its catalog slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipItem {
    pub item: String,
}

#[async_trait]
impl GameCommand for EquipItem {
    const METADATA: CommandMetadata =
        CommandMetadata::new("equip_item", AccessLevel::Player, ExecutionMode::ServerAuthoritative);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let slot = ctx
            .logic()
            .config()
            .catalog
            .get(&self.item)
            .map(|entry| entry.slot)
            .ok_or_else(|| DomainError::UnknownItem(self.item.clone()))?;
        ctx.logic().equipment().equip(slot, &self.item)?;

        let player = ctx.player();
        ctx.effects().publish(ItemEquipped {
            player,
            slot,
            item: self.item.clone(),
        });
        Ok(())
    }
}

/// Collects every queued reward into the balances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimUncollectedRewards {}

#[async_trait]
impl GameCommand for ClaimUncollectedRewards {
    const METADATA: CommandMetadata = CommandMetadata::new(
        "claim_uncollected_rewards",
        AccessLevel::Player,
        ExecutionMode::ServerAuthoritative,
    );

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let claimed = ctx.logic().rewards().claim_all()?;

        let mut totals: BTreeMap<Currency, u64> = BTreeMap::new();
        for reward in &claimed {
            *totals.entry(reward.currency).or_insert(0) += reward.amount;
        }

        let player = ctx.player();
        for (currency, amount) in totals {
            let balance = ctx.logic().currency().balance(currency);
            ctx.effects().publish(CurrencyChanged {
                player,
                currency,
                delta: amount as i64,
                balance,
            });
        }
        ctx.effects().publish(RewardsClaimed {
            player,
            rewards: claimed,
        });
        Ok(())
    }
}

/// Credits a validated in-app purchase. Submitted by the receipt validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantPurchase {
    pub product: String,
    pub receipt: String,
}

#[async_trait]
impl GameCommand for GrantPurchase {
    const METADATA: CommandMetadata =
        CommandMetadata::new("grant_purchase", AccessLevel::Service, ExecutionMode::ServerAuthoritative);

    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<(), DomainError> {
        let grants = ctx
            .logic()
            .config()
            .products
            .get(&self.product)
            .cloned()
            .ok_or_else(|| DomainError::UnknownItem(self.product.clone()))?;
        ctx.logic().history().consume_receipt(&self.receipt)?;

        let player = ctx.player();
        for (currency, amount) in grants {
            let balance = ctx.logic().currency().credit(currency, amount);
            ctx.effects().publish(CurrencyChanged {
                player,
                currency,
                delta: amount as i64,
                balance,
            });
        }
        ctx.effects().publish(PurchaseGranted {
            player,
            product: self.product.clone(),
            receipt: self.receipt.clone(),
        });
        Ok(())
    }
}
