// Error taxonomy for the reconciliation core.
// Duplicates are NOT errors - they are a classification outcome. A store
// uniqueness violation on insert is recovered as that outcome, never
// surfaced. Everything here is a condition the caller has to decide about.

use thiserror::Error;

/// One installment group or subscription stream that a bulk delete would
/// split - some member rows selected, some left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSplit {
    /// Installment group id or subscription id (as text) being split
    pub group: String,
    pub selected: usize,
    pub remaining: usize,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// More than one plausible projected placeholder matched an incoming
    /// row. Must be reported to the caller, never auto-resolved by guessing.
    #[error("Ambiguous match: {reason} (candidate rows: {candidates:?})")]
    AmbiguousMatch { reason: String, candidates: Vec<i64> },

    #[error("Invalid merge request: {0}")]
    InvalidMergeRequest(String),

    /// A merge source/target already points at another business. Chains are
    /// a data invariant violation to flag, not to resolve by chasing.
    #[error("Business {business_id} is already merged into {merged_to_id}")]
    MergeChainDetected { business_id: i64, merged_to_id: i64 },

    #[error("Business not found: {0}")]
    BusinessNotFound(i64),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(i64),

    /// A delete request would remove some but not all payments of an
    /// installment group or subscription stream. Requires explicit
    /// confirmation listing the split.
    #[error("Delete would split {} group(s); confirmation required", splits.len())]
    PartialGroupDeletion { splits: Vec<GroupSplit> },

    #[error("Invalid statement row: {0}")]
    InvalidRow(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
