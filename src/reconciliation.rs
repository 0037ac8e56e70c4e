// ⚖️ Reconciliation Engine - classify incoming statement rows
//
// For each parsed row, decide exactly one of: brand-new transaction,
// duplicate of something already stored, payment joining an installment
// group, completion of a previously-projected occurrence, or an ambiguity
// the caller must resolve. Re-running the same statement must be a no-op at
// every step: all hashes recompute identically and every existence check
// short-circuits to duplicate.

use chrono::{Months, NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::db::{
    self, InsertOutcome, NewTransaction, TransactionKind, TransactionStatus,
};
use crate::error::Result;
use crate::hashing::{installment_group_id, installment_payment_hash, transaction_hash};
use crate::ingest::{PaymentType, StatementRow};

// ============================================================================
// INGEST OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Fresh row inserted (one-time charge, or an installment payment that
    /// establishes its group)
    New { transaction_id: i64 },

    /// The identity already exists in the store - nothing written
    Duplicate,

    /// Payment N joined an existing installment group as a fresh row
    GroupJoined { transaction_id: i64, group_id: String },

    /// A projected placeholder was confirmed and completed in place
    Completed { transaction_id: i64 },

    /// More than one plausible placeholder matched; the caller decides.
    /// Never auto-resolved by guessing.
    Ambiguous { reason: String, candidates: Vec<i64> },
}

// ============================================================================
// BATCH SUMMARY
// ============================================================================

/// A row the batch could not settle: ambiguous match or invalid input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedRow {
    pub row_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub new: usize,
    pub duplicates: usize,
    pub group_joined: usize,
    pub completed: usize,
    pub unresolved: Vec<UnresolvedRow>,
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        ReconciliationEngine { config }
    }

    /// Classify and persist one statement row.
    pub fn ingest(&self, conn: &Connection, row: &StatementRow) -> Result<IngestOutcome> {
        self.ingest_at(conn, row, Utc::now().date_naive())
    }

    /// Same as `ingest`, with an explicit "today" for the projection cutoff.
    pub fn ingest_at(
        &self,
        conn: &Connection,
        row: &StatementRow,
        today: NaiveDate,
    ) -> Result<IngestOutcome> {
        row.validate()?;
        let business_id = db::find_or_create_business(conn, &row.business_name)?;

        let outcome = match row.payment_type {
            PaymentType::OneTime => self.ingest_one_time(conn, row, business_id)?,
            PaymentType::Installments => self.ingest_installment(conn, row, business_id, today)?,
        };

        debug!(business = %row.normalized_business(), ?outcome, "classified row");
        Ok(outcome)
    }

    /// Ingest a whole upload batch, strictly sequentially, so that
    /// group-establishing decisions are ordered and cannot race within the
    /// batch. Rows the engine cannot settle are reported in the summary,
    /// never silently dropped.
    pub fn ingest_batch(
        &self,
        conn: &Connection,
        rows: &[StatementRow],
        today: NaiveDate,
    ) -> Result<BatchSummary> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut summary = BatchSummary {
            batch_id: batch_id.clone(),
            total: rows.len(),
            new: 0,
            duplicates: 0,
            group_joined: 0,
            completed: 0,
            unresolved: Vec::new(),
        };

        for (row_index, row) in rows.iter().enumerate() {
            let mut row = row.clone();
            row.upload_batch_hint = Some(batch_id.clone());

            match self.ingest_at(conn, &row, today) {
                Ok(IngestOutcome::New { .. }) => summary.new += 1,
                Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
                Ok(IngestOutcome::GroupJoined { .. }) => summary.group_joined += 1,
                Ok(IngestOutcome::Completed { .. }) => summary.completed += 1,
                Ok(IngestOutcome::Ambiguous { reason, .. }) => {
                    summary.unresolved.push(UnresolvedRow { row_index, reason });
                }
                Err(crate::error::LedgerError::InvalidRow(reason)) => {
                    summary.unresolved.push(UnresolvedRow { row_index, reason });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            batch = %summary.batch_id,
            new = summary.new,
            duplicates = summary.duplicates,
            group_joined = summary.group_joined,
            completed = summary.completed,
            unresolved = summary.unresolved.len(),
            "batch ingested"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // One-time charges
    // ------------------------------------------------------------------------

    fn ingest_one_time(
        &self,
        conn: &Connection,
        row: &StatementRow,
        business_id: i64,
    ) -> Result<IngestOutcome> {
        let normalized = row.normalized_business();
        let hash = transaction_hash(
            &normalized,
            row.deal_date,
            row.charged_amount_ils,
            &row.card_last4,
            0,
            PaymentType::OneTime,
            row.is_refund,
        );

        if let Some(existing) = db::find_transaction_by_hash(conn, &hash)? {
            // A charge landing exactly on its projected date computes the
            // placeholder's own hash; that is a confirmation, not a dup.
            if existing.status == TransactionStatus::Projected {
                db::complete_projected(
                    conn,
                    existing.id,
                    &hash,
                    row.charged_amount_ils,
                    row.deal_date,
                    row.bank_charge_date,
                )?;
                return Ok(IngestOutcome::Completed { transaction_id: existing.id });
            }
            return Ok(IngestOutcome::Duplicate);
        }

        // A non-refund one-time charge may be the real-world counterpart of
        // a projected subscription occurrence on this business + card.
        if !row.is_refund {
            let candidates = db::find_projected_subscription_candidates(
                conn,
                business_id,
                &row.card_last4,
                row.charged_amount_ils,
                self.config.subscription_amount_tolerance,
                row.deal_date,
                self.config.subscription_date_tolerance_days,
            )?;

            match candidates.len() {
                0 => {}
                1 => {
                    let placeholder = &candidates[0];
                    db::complete_projected(
                        conn,
                        placeholder.id,
                        &hash,
                        row.charged_amount_ils,
                        row.deal_date,
                        row.bank_charge_date,
                    )?;
                    return Ok(IngestOutcome::Completed { transaction_id: placeholder.id });
                }
                _ => {
                    return Ok(IngestOutcome::Ambiguous {
                        reason: format!(
                            "{} projected subscription rows match business {} amount {:.2} around {}",
                            candidates.len(),
                            normalized,
                            row.charged_amount_ils,
                            row.deal_date,
                        ),
                        candidates: candidates.iter().map(|c| c.id).collect(),
                    });
                }
            }
        }

        match db::insert_transaction(conn, &self.new_completed(row, business_id, hash, None, None))? {
            InsertOutcome::Inserted(id) => Ok(IngestOutcome::New { transaction_id: id }),
            InsertOutcome::Duplicate => Ok(IngestOutcome::Duplicate),
        }
    }

    // ------------------------------------------------------------------------
    // Installment payments
    // ------------------------------------------------------------------------

    fn ingest_installment(
        &self,
        conn: &Connection,
        row: &StatementRow,
        business_id: i64,
        today: NaiveDate,
    ) -> Result<IngestOutcome> {
        let normalized = row.normalized_business();
        // validate() guarantees these are present and in range
        let index = row.installment_index.unwrap_or(1);
        let total = row.installment_total.unwrap_or(1);

        // The statement reports payment N dated N-1 months after the
        // purchase; back-calculate payment 1's deal date so any payment of
        // the same purchase derives the same group id.
        let group_deal_date = back_date(row.deal_date, index);
        let group_id = installment_group_id(&normalized, row.group_total(), total, group_deal_date);

        // Bucket matching: whatever already sits at (group, index) decides.
        let members = db::find_group_members_at_index(conn, &group_id, index)?;

        if members.iter().any(|m| m.status == TransactionStatus::Completed) {
            // Already recorded - including the twin "payment 1" case where a
            // second upload re-establishes the group through a different
            // card or per-payment hash. Merge into the existing row by
            // doing nothing; never create a divergent sibling.
            return Ok(IngestOutcome::Duplicate);
        }

        let projected: Vec<_> = members
            .iter()
            .filter(|m| m.status == TransactionStatus::Projected)
            .collect();

        match projected.len() {
            0 => {}
            1 => {
                let placeholder = projected[0];
                let hash = if index == 1 {
                    self.first_payment_hash(row, &normalized)
                } else {
                    installment_payment_hash(&group_id, index)
                };
                db::complete_projected(
                    conn,
                    placeholder.id,
                    &hash,
                    row.charged_amount_ils,
                    row.deal_date,
                    row.bank_charge_date,
                )?;
                return Ok(IngestOutcome::Completed { transaction_id: placeholder.id });
            }
            _ => {
                return Ok(IngestOutcome::Ambiguous {
                    reason: format!(
                        "{} projected rows at group {} index {}",
                        projected.len(),
                        group_id,
                        index,
                    ),
                    candidates: projected.iter().map(|p| p.id).collect(),
                });
            }
        }

        // Nothing at this bucket yet - fresh payment.
        let hash = if index == 1 {
            let hash = self.first_payment_hash(row, &normalized);
            if db::transaction_hash_exists(conn, &hash)? {
                return Ok(IngestOutcome::Duplicate);
            }
            hash
        } else {
            installment_payment_hash(&group_id, index)
        };

        let group_established = db::find_group_members(conn, &group_id)?.is_empty();

        let new_tx = self.new_completed(
            row,
            business_id,
            hash,
            Some((group_id.clone(), index, total)),
            None,
        );
        let inserted_id = match db::insert_transaction(conn, &new_tx)? {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => return Ok(IngestOutcome::Duplicate),
        };

        // First sighting of the group: materialize projected placeholders
        // for the future remaining payments so later uploads bucket-match
        // instead of guessing. Past indexes are left to backfill uploads.
        if group_established {
            self.project_future_siblings(conn, row, business_id, &group_id, index, total, today)?;
        }

        if index == 1 {
            Ok(IngestOutcome::New { transaction_id: inserted_id })
        } else {
            Ok(IngestOutcome::GroupJoined { transaction_id: inserted_id, group_id })
        }
    }

    fn first_payment_hash(&self, row: &StatementRow, normalized: &str) -> String {
        transaction_hash(
            normalized,
            row.deal_date,
            row.charged_amount_ils,
            &row.card_last4,
            1,
            PaymentType::Installments,
            row.is_refund,
        )
    }

    fn project_future_siblings(
        &self,
        conn: &Connection,
        row: &StatementRow,
        business_id: i64,
        group_id: &str,
        seen_index: u32,
        total: u32,
        today: NaiveDate,
    ) -> Result<()> {
        for future_index in (seen_index + 1)..=total {
            let charge_date = forward_date(row.deal_date, future_index - seen_index);
            if charge_date <= today {
                continue;
            }

            let projected = NewTransaction {
                transaction_hash: installment_payment_hash(group_id, future_index),
                business_id,
                card_last4: row.card_last4.clone(),
                deal_date: charge_date,
                bank_charge_date: None,
                charged_amount_ils: row.charged_amount_ils,
                original_amount: None,
                original_currency: None,
                exchange_rate_used: None,
                payment_type: PaymentType::Installments,
                kind: TransactionKind::Regular,
                installment_group_id: Some(group_id.to_string()),
                installment_index: Some(future_index),
                installment_total: Some(total),
                subscription_id: None,
                status: TransactionStatus::Projected,
                projected_charge_date: Some(charge_date),
                actual_charge_date: None,
                is_refund: false,
                source_file: row.source_file.clone(),
                upload_batch_id: row.upload_batch_hint.clone(),
            };
            // A concurrent batch may have raced us to this sibling; the
            // hash constraint settles it.
            db::insert_transaction(conn, &projected)?;
        }
        Ok(())
    }

    fn new_completed(
        &self,
        row: &StatementRow,
        business_id: i64,
        hash: String,
        installment: Option<(String, u32, u32)>,
        subscription_id: Option<i64>,
    ) -> NewTransaction {
        let (group_id, index, total) = match installment {
            Some((g, i, t)) => (Some(g), Some(i), Some(t)),
            None => (None, None, None),
        };
        NewTransaction {
            transaction_hash: hash,
            business_id,
            card_last4: row.card_last4.clone(),
            deal_date: row.deal_date,
            bank_charge_date: row.bank_charge_date,
            charged_amount_ils: row.charged_amount_ils,
            original_amount: row.original_amount,
            original_currency: row.original_currency.clone(),
            exchange_rate_used: row.exchange_rate_used,
            payment_type: row.payment_type,
            kind: TransactionKind::Regular,
            installment_group_id: group_id,
            installment_index: index,
            installment_total: total,
            subscription_id,
            status: TransactionStatus::Completed,
            projected_charge_date: None,
            actual_charge_date: Some(row.deal_date),
            is_refund: row.is_refund,
            source_file: row.source_file.clone(),
            upload_batch_id: row.upload_batch_hint.clone(),
        }
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Deal date of payment 1, back-calculated from payment `index`'s reported
/// date.
fn back_date(reported: NaiveDate, index: u32) -> NaiveDate {
    reported
        .checked_sub_months(Months::new(index - 1))
        .unwrap_or(reported)
}

fn forward_date(from: NaiveDate, months: u32) -> NaiveDate {
    from.checked_add_months(Months::new(months)).unwrap_or(from)
}

// ============================================================================
// TESTS
// ============================================================================
