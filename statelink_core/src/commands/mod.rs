//! Concrete command types.
//!
//! Each type declares its metadata next to its fields and checks its own
//! precondition before touching any mutator.

mod account;
mod admin;
mod economy;
mod matches;

pub use account::{CompleteMilestone, SanitizeRecord, SelectGameMode};
pub use admin::{ForceCorrectRecord, UnlockAllMilestones};
pub use economy::{ClaimUncollectedRewards, EquipItem, GrantPurchase, PurchaseItem};
pub use matches::{EndOfMatchRewards, RemoveParticipant};

use crate::registry::CommandRegistry;

/// Registry of every command type shipped with the crate.
pub fn standard_registry() -> CommandRegistry {
    CommandRegistry::builder()
        .initialization::<SanitizeRecord>()
        .command::<CompleteMilestone>()
        .command::<PurchaseItem>()
        .command::<EquipItem>()
        .command::<ClaimUncollectedRewards>()
        .frame_derived::<EndOfMatchRewards>()
        .consensus::<RemoveParticipant>()
        .command::<GrantPurchase>()
        .command::<ForceCorrectRecord>()
        .command::<UnlockAllMilestones>()
        .command::<SelectGameMode>()
        .build()
}
