// 🔁 Subscription Entity - recurring-charge definitions
//
// A subscription owns a stream of generated transaction rows: elapsed
// occurrences land as `completed`, future ones as `projected` awaiting the
// real bank charge. Occurrence dates are computed here; the projection
// engine decides what to do with them.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

// ============================================================================
// FREQUENCY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Monthly,
    Annual,
}

impl Frequency {
    /// Step between occurrences, in months.
    pub fn months_step(&self) -> u32 {
        match self {
            Frequency::Monthly => 1,
            Frequency::Annual => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Monthly => "monthly",
            Frequency::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Frequency> {
        match s {
            "monthly" => Some(Frequency::Monthly),
            "annual" => Some(Frequency::Annual),
            _ => None,
        }
    }
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Ended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<SubscriptionStatus> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "ended" => Some(SubscriptionStatus::Ended),
            _ => None,
        }
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub business_id: i64,
    pub card_last4: String,
    pub amount: f64,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub status: SubscriptionStatus,
    pub created_from_suggestion: bool,
}

impl Subscription {
    /// Every expected occurrence date from `start_date` through `end_date`,
    /// or through `horizon_years` past the start when open-ended. Month
    /// stepping clamps to month end (Jan 31 → Feb 28) per chrono semantics.
    pub fn occurrence_dates(&self, horizon_years: u32) -> Vec<NaiveDate> {
        let step = self.frequency.months_step();
        let bound = self
            .end_date
            .unwrap_or_else(|| clamp_add_months(self.start_date, 12 * horizon_years));

        let mut dates = Vec::new();
        let mut i = 0u32;
        loop {
            let date = clamp_add_months(self.start_date, i * step);
            if date > bound {
                break;
            }
            dates.push(date);
            i += 1;
        }
        dates
    }
}

fn clamp_add_months(date: NaiveDate, months: u32) -> NaiveDate {
    // checked_add_months only fails out past year 262143; the projection
    // horizon keeps us far from that.
    date.checked_add_months(Months::new(months)).unwrap_or(date)
}

// ============================================================================
// SUBSCRIPTION SUGGESTION
// ============================================================================

/// A detected recurrence pattern: the same business + card + amount charged
/// at roughly regular intervals. Raised for the user to confirm into a real
/// subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSuggestion {
    pub business_id: i64,
    pub card_last4: String,
    pub amount: f64,
    pub frequency: Frequency,
    pub occurrence_count: usize,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
}

// ============================================================================
// TESTS
// ============================================================================
