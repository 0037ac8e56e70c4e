// 🔮 Subscription Projection Engine - forward-looking occurrence rows
//
// Runs synchronously at subscription-creation time (no background jobs):
// elapsed occurrences are backfilled as completed history, future ones are
// written as projected placeholders that the reconciliation engine later
// completes in place when the real bank charges land.

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::db::{
    self, InsertOutcome, NewTransaction, TransactionKind, TransactionStatus,
};
use crate::entities::subscription::{Frequency, Subscription, SubscriptionStatus, SubscriptionSuggestion};
use crate::error::{LedgerError, Result};
use crate::hashing::transaction_hash;
use crate::ingest::PaymentType;

// ============================================================================
// PARAMETERS / RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub business_id: i64,
    pub card_last4: String,
    pub amount: f64,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_from_suggestion: bool,

    /// Pre-existing transaction ids the caller already identified as
    /// occurrences of this subscription. They are linked, and no synthetic
    /// row is generated for their months.
    #[serde(default)]
    pub backfill_transaction_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionResult {
    pub subscription: Subscription,
    pub projected_count: usize,
    pub backfilled_count: usize,
    pub linked_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelSubscriptionResult {
    pub subscription_id: i64,
    pub cancelled_projections: usize,
}

// ============================================================================
// PROJECTION ENGINE
// ============================================================================

pub struct SubscriptionProjectionEngine {
    config: EngineConfig,
}

impl SubscriptionProjectionEngine {
    pub fn new(config: EngineConfig) -> Self {
        SubscriptionProjectionEngine { config }
    }

    /// Create a subscription and synchronously generate its occurrence rows.
    pub fn create_subscription(
        &self,
        conn: &Connection,
        params: &SubscriptionParams,
    ) -> Result<CreateSubscriptionResult> {
        self.create_subscription_at(conn, params, Utc::now().date_naive())
    }

    /// Same as `create_subscription`, with an explicit "today" deciding the
    /// completed/projected split.
    pub fn create_subscription_at(
        &self,
        conn: &Connection,
        params: &SubscriptionParams,
        today: NaiveDate,
    ) -> Result<CreateSubscriptionResult> {
        let business = db::get_business(conn, params.business_id)?
            .ok_or(LedgerError::BusinessNotFound(params.business_id))?;

        let tx = conn.unchecked_transaction()?;

        let subscription_id = db::insert_subscription(
            &tx,
            &db::NewSubscription {
                business_id: params.business_id,
                card_last4: params.card_last4.clone(),
                amount: params.amount,
                frequency: params.frequency,
                start_date: params.start_date,
                end_date: params.end_date,
                created_from_suggestion: params.created_from_suggestion,
            },
        )?;

        // Link caller-identified historical rows first; their months are
        // already covered and must not get a synthetic twin.
        let linked_count =
            db::link_transactions_to_subscription(&tx, subscription_id, &params.backfill_transaction_ids)?;
        let mut covered_months = Vec::new();
        for id in &params.backfill_transaction_ids {
            if let Some(linked) = db::get_transaction(&tx, *id)? {
                covered_months.push(month_key(linked.deal_date));
            }
        }

        let subscription = db::get_subscription(&tx, subscription_id)?
            .ok_or(LedgerError::SubscriptionNotFound(subscription_id))?;

        let mut projected_count = 0usize;
        let mut backfilled_count = 0usize;

        for occurrence in subscription.occurrence_dates(self.config.projection_horizon_years) {
            if covered_months.contains(&month_key(occurrence)) {
                continue;
            }

            let elapsed = occurrence < today;
            let row = NewTransaction {
                transaction_hash: transaction_hash(
                    &business.normalized_name,
                    occurrence,
                    params.amount,
                    &params.card_last4,
                    0,
                    PaymentType::OneTime,
                    false,
                ),
                business_id: params.business_id,
                card_last4: params.card_last4.clone(),
                deal_date: occurrence,
                bank_charge_date: None,
                charged_amount_ils: params.amount,
                original_amount: None,
                original_currency: None,
                exchange_rate_used: None,
                payment_type: PaymentType::OneTime,
                kind: TransactionKind::Subscription,
                installment_group_id: None,
                installment_index: None,
                installment_total: None,
                subscription_id: Some(subscription_id),
                status: if elapsed {
                    TransactionStatus::Completed
                } else {
                    TransactionStatus::Projected
                },
                projected_charge_date: if elapsed { None } else { Some(occurrence) },
                actual_charge_date: if elapsed { Some(occurrence) } else { None },
                is_refund: false,
                source_file: None,
                upload_batch_id: None,
            };

            // An identical charge may already sit in the store from an old
            // upload the caller did not list; the hash constraint keeps the
            // streams from doubling up.
            match db::insert_transaction(&tx, &row)? {
                InsertOutcome::Inserted(_) => {
                    if elapsed {
                        backfilled_count += 1;
                    } else {
                        projected_count += 1;
                    }
                }
                InsertOutcome::Duplicate => {}
            }
        }

        tx.commit()?;

        info!(
            subscription = subscription_id,
            projected = projected_count,
            backfilled = backfilled_count,
            linked = linked_count,
            "subscription created"
        );

        Ok(CreateSubscriptionResult {
            subscription,
            projected_count,
            backfilled_count,
            linked_count,
        })
    }

    /// Cancel a subscription: future projections are marked cancelled,
    /// completed occurrences stay as historical record.
    pub fn cancel_subscription(
        &self,
        conn: &Connection,
        subscription_id: i64,
        today: NaiveDate,
    ) -> Result<CancelSubscriptionResult> {
        let subscription = db::get_subscription(conn, subscription_id)?
            .ok_or(LedgerError::SubscriptionNotFound(subscription_id))?;

        let tx = conn.unchecked_transaction()?;
        db::update_subscription_status(&tx, subscription.id, SubscriptionStatus::Cancelled, Some(today))?;
        let cancelled_projections = db::cancel_future_projections(&tx, subscription.id, today)?;
        tx.commit()?;

        info!(
            subscription = subscription_id,
            cancelled = cancelled_projections,
            "subscription cancelled"
        );

        Ok(CancelSubscriptionResult { subscription_id, cancelled_projections })
    }

    // ------------------------------------------------------------------------
    // Recurrence detection
    // ------------------------------------------------------------------------

    /// Scan completed one-time charges for recurring business + card +
    /// amount patterns worth suggesting as subscriptions.
    pub fn detect_subscription_suggestions(
        &self,
        conn: &Connection,
    ) -> Result<Vec<SubscriptionSuggestion>> {
        let charges = db::completed_regular_charges(conn)?;

        // Group by (business, card, amount to the agora)
        let mut groups: Vec<((i64, String, i64), Vec<NaiveDate>)> = Vec::new();
        for charge in &charges {
            let key = (
                charge.business_id,
                charge.card_last4.clone(),
                (charge.charged_amount_ils * 100.0).round() as i64,
            );
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, dates)) => dates.push(charge.deal_date),
                None => groups.push((key, vec![charge.deal_date])),
            }
        }

        let mut suggestions = Vec::new();
        for ((business_id, card_last4, amount_agorot), mut dates) in groups {
            if dates.len() < self.config.min_recurrence_count {
                continue;
            }
            dates.sort_unstable();

            let intervals: Vec<i64> = dates
                .windows(2)
                .map(|w| (w[1] - w[0]).num_days())
                .collect();
            let avg = intervals.iter().sum::<i64>() / intervals.len() as i64;

            let frequency = if (25..=35).contains(&avg) {
                Frequency::Monthly
            } else if (350..=380).contains(&avg) {
                Frequency::Annual
            } else {
                continue;
            };

            suggestions.push(SubscriptionSuggestion {
                business_id,
                card_last4,
                amount: amount_agorot as f64 / 100.0,
                frequency,
                occurrence_count: dates.len(),
                first_seen: dates[0],
                last_seen: *dates.last().unwrap_or(&dates[0]),
            });
        }

        Ok(suggestions)
    }
}

impl Default for SubscriptionProjectionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

fn month_key(date: NaiveDate) -> (i32, u32) {
    use chrono::Datelike;
    (date.year(), date.month())
}

// ============================================================================
// TESTS
// ============================================================================
