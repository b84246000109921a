//! Outcome publication.
//!
//! Commands stage `OutcomeEvent`s while they run; the dispatcher publishes
//! them to an `OutcomeBus` only after the mutation set has been committed.
//! Delivery is synchronous and follows subscriber-registration order. A
//! panicking subscriber is logged and skipped; its siblings still run.

use crate::logic::MatchRewards;
use crate::record::{Currency, Milestone, Reward, Slot};
use statelink_env::{MatchId, PlayerId};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// A one-way fact describing what changed.
pub trait OutcomeEvent: Any + Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

macro_rules! outcome_event {
    ($ty:ident, $name:literal) => {
        impl OutcomeEvent for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    };
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneCompleted {
    pub player: PlayerId,
    pub milestone: Milestone,
}
outcome_event!(MilestoneCompleted, "milestone_completed");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyChanged {
    pub player: PlayerId,
    pub currency: Currency,
    pub delta: i64,
    pub balance: u64,
}
outcome_event!(CurrencyChanged, "currency_changed");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPurchased {
    pub player: PlayerId,
    pub item: String,
}
outcome_event!(ItemPurchased, "item_purchased");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEquipped {
    pub player: PlayerId,
    pub slot: Slot,
    pub item: String,
}
outcome_event!(ItemEquipped, "item_equipped");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardsClaimed {
    pub player: PlayerId,
    pub rewards: Vec<Reward>,
}
outcome_event!(RewardsClaimed, "rewards_claimed");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRewardsGranted {
    pub player: PlayerId,
    pub match_id: MatchId,
    pub placement: u32,
    pub rewards: MatchRewards,
}
outcome_event!(MatchRewardsGranted, "match_rewards_granted");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRemoved {
    pub player: PlayerId,
    pub match_id: MatchId,
    pub trophies: u32,
}
outcome_event!(ParticipantRemoved, "participant_removed");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMigrated {
    pub player: PlayerId,
    pub from: u32,
    pub to: u32,
}
outcome_event!(RecordMigrated, "record_migrated");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseGranted {
    pub player: PlayerId,
    pub product: String,
    pub receipt: String,
}
outcome_event!(PurchaseGranted, "purchase_granted");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCorrected {
    pub player: PlayerId,
    pub section: String,
}
outcome_event!(RecordCorrected, "record_corrected");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameModeSelected {
    pub mode: String,
}
outcome_event!(GameModeSelected, "game_mode_selected");

// ============================================================================
// BUS
// ============================================================================

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    label: String,
    handler: Handler,
}

/// Result of one publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Labels of subscribers that panicked
    pub failed: Vec<String>,
}

/// Type-keyed synchronous publish/subscribe bus.
#[derive(Default)]
pub struct OutcomeBus {
    subscribers: RwLock<HashMap<TypeId, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl OutcomeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers a handler for events of type `E`.
    pub fn subscribe<E, F>(&self, label: impl Into<String>, handler: F) -> SubscriptionId
    where
        E: OutcomeEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Subscription {
                id,
                label: label.into(),
                handler,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Delivers one event to every subscriber of its type.
    pub fn publish(&self, event: &dyn OutcomeEvent) -> PublishReport {
        let payload = event.as_any();
        // Snapshot so handlers may subscribe without deadlocking
        let handlers: Vec<(String, Handler)> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&Any::type_id(payload))
            .map(|list| {
                list.iter()
                    .map(|s| (s.label.clone(), Arc::clone(&s.handler)))
                    .collect()
            })
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for (label, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => report.delivered += 1,
                Err(cause) => {
                    error!(
                        subscriber = %label,
                        event = event.name(),
                        cause = %panic_message(cause.as_ref()),
                        "outcome subscriber panicked"
                    );
                    report.failed.push(label);
                }
            }
        }
        report
    }

    /// Publishes events in order.
    pub fn publish_all(&self, events: &[Box<dyn OutcomeEvent>]) -> PublishReport {
        let mut total = PublishReport::default();
        for event in events {
            let report = self.publish(event.as_ref());
            total.delivered += report.delivered;
            total.failed.extend(report.failed);
        }
        total
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
