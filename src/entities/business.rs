// 🏪 Business Entity - merchant catalog with reversible merges
//
// A business with `merged_to_id` set is a merge source: soft-deleted, no
// longer "active", its transactions repointed at the target with
// `original_business_id` preserved so the merge can be undone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// BUSINESS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: i64,

    /// Lowercased, trimmed canonical key - unique across the catalog
    pub normalized_name: String,

    /// Name shown to the user, original casing preserved
    pub display_name: String,

    pub category: Option<String>,

    /// User confirmed the auto-created record
    pub approved: bool,

    /// Single-level merge pointer. Never chased transitively: merge targets
    /// must be active, so chains are an invariant violation.
    pub merged_to_id: Option<i64>,
}

impl Business {
    /// Active = not merged away. Catalog queries must filter on this.
    pub fn is_active(&self) -> bool {
        self.merged_to_id.is_none()
    }
}

// ============================================================================
// MERGE SUGGESTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<SuggestionStatus> {
        match s {
            "pending" => Some(SuggestionStatus::Pending),
            "rejected" => Some(SuggestionStatus::Rejected),
            _ => None,
        }
    }
}

/// Candidate near-duplicate pair produced by the merge detector.
///
/// Rejection is not final: after `rejected_until` passes, the detector may
/// raise the pair again. "Is frozen" is always re-derived from that
/// timestamp at query time, never cached in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSuggestion {
    pub id: i64,
    pub business_id_1: i64,
    pub business_id_2: i64,
    pub similarity_score: f64,
    pub reason: String,
    pub status: SuggestionStatus,
    pub rejected_until: Option<DateTime<Utc>>,
}

impl MergeSuggestion {
    /// Whether a rejected suggestion is still inside its freeze window.
    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.rejected_until) {
            (SuggestionStatus::Rejected, Some(until)) => until > now,
            _ => false,
        }
    }
}
