// 🔀 Business Merge Engine - near-duplicate merchant consolidation
//
// Detection proposes pairs; the merge itself repoints historical
// transactions while preserving provenance (`original_business_id`) so it
// stays reversible. All multi-step writes commit or roll back as one unit -
// transactions repointed with the suggestion left behind is never an
// observable state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EngineConfig;
use crate::db::{self, placeholders};
use crate::error::{LedgerError, Result};
use crate::similarity::similarity;

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectMergesResult {
    pub suggestions_created: usize,
    pub businesses_compared: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub businesses_merged: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmergeResult {
    pub business_id: i64,
    pub target_id: i64,
}

/// How to delete a business that has sources merged into it. The caller
/// must choose; there is no silent default when sources exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteBusinessMode {
    /// Delete only the parent: merged sources become active again and take
    /// their provenance-tracked transactions back; the parent's own rows go.
    ParentOnly,

    /// Delete the parent and every merged source, with all their
    /// transactions.
    Cascade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteBusinessResult {
    pub businesses_deleted: usize,
    pub sources_restored: usize,
    pub transactions_deleted: usize,
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct BusinessMergeEngine {
    config: EngineConfig,
}

impl BusinessMergeEngine {
    pub fn new(config: EngineConfig) -> Self {
        BusinessMergeEngine { config }
    }

    // ------------------------------------------------------------------------
    // Detection
    // ------------------------------------------------------------------------

    /// Pairwise-compare all active businesses and raise a pending suggestion
    /// for every qualifying pair not already suggested and not inside its
    /// rejection freeze window.
    pub fn detect_merges(&self, conn: &Connection) -> Result<DetectMergesResult> {
        self.detect_merges_at(conn, Utc::now())
    }

    pub fn detect_merges_at(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<DetectMergesResult> {
        let businesses = db::active_businesses(conn)?;
        let mut suggestions_created = 0usize;

        for i in 0..businesses.len() {
            for j in (i + 1)..businesses.len() {
                let a = &businesses[i];
                let b = &businesses[j];

                let score = similarity(&a.normalized_name, &b.normalized_name);
                if score < self.config.similarity_threshold {
                    continue;
                }

                let reason = format!(
                    "'{}' and '{}' are {:.0}% similar",
                    a.display_name,
                    b.display_name,
                    score * 100.0
                );

                match db::find_suggestion_for_pair(conn, a.id, b.id)? {
                    None => {
                        db::insert_suggestion(conn, a.id, b.id, score, &reason)?;
                        suggestions_created += 1;
                    }
                    Some(existing) => {
                        if existing.is_frozen(now) {
                            continue;
                        }
                        if existing.status == crate::entities::SuggestionStatus::Rejected {
                            // Freeze expired: surface the pair again
                            conn.execute(
                                "UPDATE merge_suggestions
                                 SET status = 'pending', similarity_score = ?2, reason = ?3, rejected_until = NULL
                                 WHERE id = ?1",
                                rusqlite::params![existing.id, score, reason],
                            )?;
                            suggestions_created += 1;
                        }
                        // Still pending: nothing to do
                    }
                }
            }
        }

        info!(
            compared = businesses.len(),
            created = suggestions_created,
            "merge detection finished"
        );

        Ok(DetectMergesResult {
            suggestions_created,
            businesses_compared: businesses.len(),
        })
    }

    /// Reject a suggestion and freeze the pair for the configured window.
    pub fn reject_suggestion(
        &self,
        conn: &Connection,
        suggestion_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rejected_until = now + Duration::days(self.config.rejection_freeze_days);
        db::mark_suggestion_rejected(conn, suggestion_id, rejected_until)
    }

    // ------------------------------------------------------------------------
    // Merge / unmerge
    // ------------------------------------------------------------------------

    /// Merge businesses into `target_id`. The target must be part of the
    /// merge set; everything else in the set becomes a soft-deleted source.
    pub fn merge_businesses(
        &self,
        conn: &Connection,
        target_id: i64,
        business_ids: &[i64],
    ) -> Result<MergeResult> {
        let mut ids: Vec<i64> = business_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        if ids.len() < 2 {
            return Err(LedgerError::InvalidMergeRequest(
                "at least two businesses are required".to_string(),
            ));
        }
        if !ids.contains(&target_id) {
            return Err(LedgerError::InvalidMergeRequest(format!(
                "target business {target_id} is not part of the merge set"
            )));
        }

        // Merges always target an active business; a non-active participant
        // means a chain, which is flagged, never chased.
        for id in &ids {
            let business = db::get_business(conn, *id)?.ok_or(LedgerError::BusinessNotFound(*id))?;
            if let Some(merged_to_id) = business.merged_to_id {
                return Err(LedgerError::MergeChainDetected { business_id: *id, merged_to_id });
            }
        }

        let sources: Vec<i64> = ids.iter().copied().filter(|id| *id != target_id).collect();

        let tx = conn.unchecked_transaction()?;

        // Repoint history; remember where each row came from, but only on
        // its first-ever merge so provenance survives repeated merges.
        let ph = placeholders(sources.len());
        let sql = format!(
            "UPDATE transactions
             SET original_business_id = COALESCE(original_business_id, business_id),
                 business_id = ?
             WHERE business_id IN ({ph})"
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(target_id)];
        for id in &sources {
            params_vec.push(Box::new(*id));
        }
        tx.execute(
            &sql,
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
        )?;

        db::delete_suggestions_referencing(&tx, &sources)?;

        let ph = placeholders(sources.len());
        let sql = format!("UPDATE businesses SET merged_to_id = ? WHERE id IN ({ph})");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(target_id)];
        for id in &sources {
            params_vec.push(Box::new(*id));
        }
        tx.execute(
            &sql,
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
        )?;

        tx.commit()?;

        info!(target = target_id, merged = sources.len(), "businesses merged");
        Ok(MergeResult { businesses_merged: sources.len() })
    }

    /// Undo a merge for one source business. Only transactions that carry
    /// provenance come back; rows merged before provenance tracking existed
    /// stay where they are (documented behavior, not recoverable).
    pub fn unmerge_business(&self, conn: &Connection, business_id: i64) -> Result<UnmergeResult> {
        let business = db::get_business(conn, business_id)?
            .ok_or(LedgerError::BusinessNotFound(business_id))?;
        let target_id = business.merged_to_id.ok_or_else(|| {
            LedgerError::InvalidMergeRequest(format!("business {business_id} is not merged"))
        })?;

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE transactions SET business_id = ?1 WHERE original_business_id = ?1",
            [business_id],
        )?;
        tx.execute(
            "UPDATE businesses SET merged_to_id = NULL WHERE id = ?1",
            [business_id],
        )?;
        tx.commit()?;

        info!(business = business_id, target = target_id, "business unmerged");
        Ok(UnmergeResult { business_id, target_id })
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Delete a business. When sources were merged into it, `mode` decides
    /// between restoring them (`ParentOnly`) and deleting everything
    /// (`Cascade`); passing no mode in that case is an error.
    pub fn delete_business(
        &self,
        conn: &Connection,
        business_id: i64,
        mode: Option<DeleteBusinessMode>,
    ) -> Result<DeleteBusinessResult> {
        db::get_business(conn, business_id)?.ok_or(LedgerError::BusinessNotFound(business_id))?;
        let sources = db::merged_sources(conn, business_id)?;

        if !sources.is_empty() && mode.is_none() {
            return Err(LedgerError::InvalidMergeRequest(format!(
                "business {business_id} has {} merged source(s); choose parent_only or cascade",
                sources.len()
            )));
        }

        let tx = conn.unchecked_transaction()?;
        let result = match mode {
            Some(DeleteBusinessMode::Cascade) if !sources.is_empty() => {
                let mut all_ids: Vec<i64> = sources.iter().map(|s| s.id).collect();
                all_ids.push(business_id);
                let transactions_deleted = delete_businesses_with_rows(&tx, &all_ids)?;
                DeleteBusinessResult {
                    businesses_deleted: all_ids.len(),
                    sources_restored: 0,
                    transactions_deleted,
                }
            }
            Some(DeleteBusinessMode::ParentOnly) if !sources.is_empty() => {
                // Give each source its provenance-tracked rows back, then
                // drop the parent with whatever it still owns.
                let source_ids: Vec<i64> = sources.iter().map(|s| s.id).collect();
                for source_id in &source_ids {
                    tx.execute(
                        "UPDATE transactions SET business_id = ?1 WHERE original_business_id = ?1",
                        [source_id],
                    )?;
                }
                let ph = placeholders(source_ids.len());
                let sql = format!("UPDATE businesses SET merged_to_id = NULL WHERE id IN ({ph})");
                tx.execute(&sql, rusqlite::params_from_iter(source_ids.iter()))?;

                let transactions_deleted = delete_businesses_with_rows(&tx, &[business_id])?;
                DeleteBusinessResult {
                    businesses_deleted: 1,
                    sources_restored: source_ids.len(),
                    transactions_deleted,
                }
            }
            _ => {
                let transactions_deleted = delete_businesses_with_rows(&tx, &[business_id])?;
                DeleteBusinessResult {
                    businesses_deleted: 1,
                    sources_restored: 0,
                    transactions_deleted,
                }
            }
        };
        tx.commit()?;

        info!(
            business = business_id,
            deleted = result.businesses_deleted,
            restored = result.sources_restored,
            "business deleted"
        );
        Ok(result)
    }
}

impl Default for BusinessMergeEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Remove businesses and every row that hangs off them: transactions (owned
/// or origin-tracked), subscriptions, suggestions, then the business rows.
fn delete_businesses_with_rows(conn: &Connection, business_ids: &[i64]) -> Result<usize> {
    let ph = placeholders(business_ids.len());
    let doubled: Vec<i64> = business_ids.iter().chain(business_ids.iter()).copied().collect();

    let sql = format!(
        "DELETE FROM transactions WHERE business_id IN ({ph}) OR original_business_id IN ({ph})"
    );
    let transactions_deleted = conn.execute(&sql, rusqlite::params_from_iter(doubled.iter()))?;

    let sql = format!("DELETE FROM subscriptions WHERE business_id IN ({ph})");
    conn.execute(&sql, rusqlite::params_from_iter(business_ids.iter()))?;

    db::delete_suggestions_referencing(conn, business_ids)?;

    let sql = format!("DELETE FROM businesses WHERE id IN ({ph})");
    conn.execute(&sql, rusqlite::params_from_iter(business_ids.iter()))?;

    Ok(transactions_deleted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::db::{setup_database, InsertOutcome, NewTransaction, TransactionKind, TransactionStatus};
    use crate::entities::SuggestionStatus;
    use crate::ingest::PaymentType;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn add_transactions(conn: &Connection, business_id: i64, count: usize, tag: &str) -> Vec<i64> {
        let mut ids = Vec::new();
        for n in 0..count {
            let tx = NewTransaction {
                transaction_hash: format!("{tag}-{n}"),
                business_id,
                card_last4: "4521".to_string(),
                deal_date: date(2025, 1, 1 + n as u32),
                bank_charge_date: None,
                charged_amount_ils: 10.0 + n as f64,
                original_amount: None,
                original_currency: None,
                exchange_rate_used: None,
                payment_type: PaymentType::OneTime,
                kind: TransactionKind::Regular,
                installment_group_id: None,
                installment_index: None,
                installment_total: None,
                subscription_id: None,
                status: TransactionStatus::Completed,
                projected_charge_date: None,
                actual_charge_date: None,
                is_refund: false,
                source_file: None,
                upload_batch_id: None,
            };
            match db::insert_transaction(conn, &tx).unwrap() {
                InsertOutcome::Inserted(id) => ids.push(id),
                InsertOutcome::Duplicate => unreachable!(),
            }
        }
        ids
    }

    #[test]
    fn test_detect_merges_suggests_similar_pair_only() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        db::find_or_create_business(&conn, "SuperPharm").unwrap();
        db::find_or_create_business(&conn, "McDonald's").unwrap();

        let result = engine.detect_merges_at(&conn, Utc::now()).unwrap();
        assert_eq!(result.businesses_compared, 3);
        assert_eq!(result.suggestions_created, 1);

        let pending = db::pending_suggestions(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].similarity_score >= 0.85);
    }

    #[test]
    fn test_detect_merges_does_not_duplicate_pending() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        db::find_or_create_business(&conn, "SuperPharm").unwrap();

        engine.detect_merges_at(&conn, Utc::now()).unwrap();
        let second = engine.detect_merges_at(&conn, Utc::now()).unwrap();
        assert_eq!(second.suggestions_created, 0, "pending pair must not re-suggest");
    }

    #[test]
    fn test_rejection_freeze_window() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        db::find_or_create_business(&conn, "SuperPharm").unwrap();

        let now = Utc::now();
        engine.detect_merges_at(&conn, now).unwrap();
        let suggestion = &db::pending_suggestions(&conn).unwrap()[0];
        engine.reject_suggestion(&conn, suggestion.id, now).unwrap();

        // Inside the 30-day freeze: stays quiet
        let inside = engine.detect_merges_at(&conn, now + Duration::days(29)).unwrap();
        assert_eq!(inside.suggestions_created, 0);

        // After the freeze: surfaced again
        let after = engine.detect_merges_at(&conn, now + Duration::days(31)).unwrap();
        assert_eq!(after.suggestions_created, 1);
        let reopened = db::pending_suggestions(&conn).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].status, SuggestionStatus::Pending);
    }

    #[test]
    fn test_merge_scenario_five_plus_three() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        let b = db::find_or_create_business(&conn, "SuperPharm").unwrap();
        let t = db::find_or_create_business(&conn, "Super Pharm Ltd").unwrap();
        add_transactions(&conn, a, 5, "a");
        add_transactions(&conn, b, 3, "b");

        let result = engine.merge_businesses(&conn, t, &[t, a, b]).unwrap();
        assert_eq!(result.businesses_merged, 2);

        assert_eq!(db::count_transactions_for_business(&conn, t).unwrap(), 8);
        assert_eq!(db::count_transactions_for_business(&conn, a).unwrap(), 0);

        let business_a = db::get_business(&conn, a).unwrap().unwrap();
        let business_b = db::get_business(&conn, b).unwrap().unwrap();
        assert_eq!(business_a.merged_to_id, Some(t));
        assert_eq!(business_b.merged_to_id, Some(t));

        // Every repointed row remembers its origin
        for tx in db::all_transactions(&conn).unwrap() {
            assert_eq!(tx.business_id, t);
            let origin = tx.original_business_id.unwrap();
            assert!(origin == a || origin == b);
        }

        // Active catalog no longer lists the sources
        let active: Vec<i64> = db::active_businesses(&conn).unwrap().iter().map(|x| x.id).collect();
        assert_eq!(active, vec![t]);
    }

    #[test]
    fn test_merge_is_reversible() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        let b = db::find_or_create_business(&conn, "SuperPharm").unwrap();
        let t = db::find_or_create_business(&conn, "Super Pharm Ltd").unwrap();
        add_transactions(&conn, a, 5, "a");
        add_transactions(&conn, b, 3, "b");

        engine.merge_businesses(&conn, t, &[t, a, b]).unwrap();

        let undo = engine.unmerge_business(&conn, a).unwrap();
        assert_eq!(undo, UnmergeResult { business_id: a, target_id: t });

        assert_eq!(db::count_transactions_for_business(&conn, a).unwrap(), 5);
        assert_eq!(db::count_transactions_for_business(&conn, t).unwrap(), 3, "b's rows stay merged");
        assert!(db::get_business(&conn, a).unwrap().unwrap().is_active());

        engine.unmerge_business(&conn, b).unwrap();
        assert_eq!(db::count_transactions_for_business(&conn, b).unwrap(), 3);
        assert_eq!(db::count_transactions_for_business(&conn, t).unwrap(), 0);
    }

    #[test]
    fn test_unmerge_without_provenance_recovers_nothing() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Old Shop").unwrap();
        let t = db::find_or_create_business(&conn, "New Shop").unwrap();

        // A row merged before provenance tracking: repointed, origin lost
        add_transactions(&conn, t, 1, "legacy");
        conn.execute("UPDATE businesses SET merged_to_id = ?1 WHERE id = ?2", rusqlite::params![t, a])
            .unwrap();

        let undo = engine.unmerge_business(&conn, a).unwrap();
        assert_eq!(undo.target_id, t);
        assert_eq!(
            db::count_transactions_for_business(&conn, a).unwrap(),
            0,
            "rows without original_business_id stay with the target"
        );
        assert!(db::get_business(&conn, a).unwrap().unwrap().is_active());
    }

    #[test]
    fn test_merge_validations() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "A").unwrap();
        let b = db::find_or_create_business(&conn, "B").unwrap();
        let c = db::find_or_create_business(&conn, "C").unwrap();

        let err = engine.merge_businesses(&conn, a, &[a]).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMergeRequest(_)), "single business");

        let err = engine.merge_businesses(&conn, c, &[a, b]).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMergeRequest(_)), "target outside set");

        let err = engine.merge_businesses(&conn, a, &[a, 999]).unwrap_err();
        assert!(matches!(err, LedgerError::BusinessNotFound(999)));

        // A source already merged elsewhere is a chain, flagged not chased
        engine.merge_businesses(&conn, a, &[a, b]).unwrap();
        let err = engine.merge_businesses(&conn, c, &[c, b]).unwrap_err();
        assert!(matches!(err, LedgerError::MergeChainDetected { business_id, .. } if business_id == b));
    }

    #[test]
    fn test_merge_consumes_pending_suggestions() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        db::find_or_create_business(&conn, "SuperPharm").unwrap();

        engine.detect_merges_at(&conn, Utc::now()).unwrap();
        let suggestion = &db::pending_suggestions(&conn).unwrap()[0];
        let (a, b) = (suggestion.business_id_1, suggestion.business_id_2);

        engine.merge_businesses(&conn, a, &[a, b]).unwrap();
        assert!(db::pending_suggestions(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_delete_parent_requires_explicit_mode() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        let t = db::find_or_create_business(&conn, "Super Pharm Ltd").unwrap();
        add_transactions(&conn, a, 2, "a");
        engine.merge_businesses(&conn, t, &[t, a]).unwrap();

        let err = engine.delete_business(&conn, t, None).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMergeRequest(_)), "no silent default");
    }

    #[test]
    fn test_delete_parent_only_restores_sources() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        let t = db::find_or_create_business(&conn, "Super Pharm Ltd").unwrap();
        add_transactions(&conn, a, 2, "a");
        add_transactions(&conn, t, 1, "t");
        engine.merge_businesses(&conn, t, &[t, a]).unwrap();

        let result = engine
            .delete_business(&conn, t, Some(DeleteBusinessMode::ParentOnly))
            .unwrap();
        assert_eq!(result.businesses_deleted, 1);
        assert_eq!(result.sources_restored, 1);
        assert_eq!(result.transactions_deleted, 1, "only the parent's own row goes");

        assert!(db::get_business(&conn, t).unwrap().is_none());
        assert!(db::get_business(&conn, a).unwrap().unwrap().is_active());
        assert_eq!(db::count_transactions_for_business(&conn, a).unwrap(), 2);
    }

    #[test]
    fn test_delete_cascade_removes_everything() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Super-Pharm").unwrap();
        let t = db::find_or_create_business(&conn, "Super Pharm Ltd").unwrap();
        add_transactions(&conn, a, 2, "a");
        add_transactions(&conn, t, 1, "t");
        engine.merge_businesses(&conn, t, &[t, a]).unwrap();

        let result = engine
            .delete_business(&conn, t, Some(DeleteBusinessMode::Cascade))
            .unwrap();
        assert_eq!(result.businesses_deleted, 2);
        assert_eq!(result.transactions_deleted, 3);

        assert!(db::get_business(&conn, t).unwrap().is_none());
        assert!(db::get_business(&conn, a).unwrap().is_none());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_delete_business_without_sources_needs_no_mode() {
        let conn = test_conn();
        let engine = BusinessMergeEngine::default();
        let a = db::find_or_create_business(&conn, "Solo Shop").unwrap();
        add_transactions(&conn, a, 2, "a");

        let result = engine.delete_business(&conn, a, None).unwrap();
        assert_eq!(result.businesses_deleted, 1);
        assert_eq!(result.transactions_deleted, 2);
    }
}
