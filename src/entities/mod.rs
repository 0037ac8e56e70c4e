// Entity Models
//
// Each entity is a plain row struct mirroring its table. Businesses carry a
// single-level merge pointer (`merged_to_id`); subscriptions own a stream of
// generated transaction rows split into completed and projected occurrences.

pub mod business;
pub mod subscription;

pub use business::{Business, MergeSuggestion, SuggestionStatus};
pub use subscription::{
    Frequency, Subscription, SubscriptionStatus, SubscriptionSuggestion,
};
