// Transaction Identity & Reconciliation Core - Library
// Decides whether an incoming statement line is new, a duplicate, one leg of
// an installment purchase, or an occurrence of a recurring subscription; and
// keeps the merchant catalog deduplicated through reversible merges.

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod hashing;       // content-addressed transaction / group identities
pub mod ingest;        // parsed statement row contract + CSV adapter
pub mod merge;         // business merge engine
pub mod projection;    // subscription projection engine
pub mod reconciliation; // the ingest state machine
pub mod similarity;    // edit-distance scoring

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::{
    setup_database, InsertOutcome, NewTransaction, Transaction, TransactionKind,
    TransactionStatus,
};
pub use entities::{
    Business, Frequency, MergeSuggestion, Subscription, SubscriptionStatus,
    SubscriptionSuggestion, SuggestionStatus,
};
pub use error::{GroupSplit, LedgerError, Result};
pub use hashing::{installment_group_id, installment_payment_hash, transaction_hash};
pub use ingest::{load_statement_rows, normalize_business_name, PaymentType, StatementRow};
pub use merge::{
    BusinessMergeEngine, DeleteBusinessMode, DeleteBusinessResult, DetectMergesResult,
    MergeResult, UnmergeResult,
};
pub use projection::{
    CancelSubscriptionResult, CreateSubscriptionResult, SubscriptionParams,
    SubscriptionProjectionEngine,
};
pub use reconciliation::{BatchSummary, IngestOutcome, ReconciliationEngine, UnresolvedRow};
pub use similarity::{edit_distance, find_similar, similarity, SimilarMatch};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
