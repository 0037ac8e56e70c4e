// 🗄️ Store Layer - SQLite persistence for the reconciliation core
//
// The unique index on transactions.transaction_hash is the authoritative
// duplicate arbiter across concurrent upload batches: a constraint violation
// on insert is recovered as "already stored", never surfaced as an error.
// Multi-step operations (merge, unmerge, cascading deletes) run inside
// Connection::transaction() and commit or roll back as one unit.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entities::business::{Business, MergeSuggestion, SuggestionStatus};
use crate::entities::subscription::{Frequency, Subscription, SubscriptionStatus};
use crate::error::{GroupSplit, LedgerError, Result};
use crate::ingest::PaymentType;

// ============================================================================
// TRANSACTION STATUS / KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Confirmed by a real bank-reported charge
    Completed,

    /// Synthetically generated, awaiting its bank-reported counterpart
    Projected,

    /// A projection that will never materialize (subscription cancelled)
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
            TransactionStatus::Projected => "projected",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TransactionStatus> {
        match s {
            "completed" => Some(TransactionStatus::Completed),
            "projected" => Some(TransactionStatus::Projected),
            "cancelled" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Regular,
    Subscription,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Regular => "regular",
            TransactionKind::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Option<TransactionKind> {
        match s {
            "regular" => Some(TransactionKind::Regular),
            "subscription" => Some(TransactionKind::Subscription),
            _ => None,
        }
    }
}

// ============================================================================
// TRANSACTION ROW
// ============================================================================

/// A stored charge or refund event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,

    /// Content-addressed identity - unique across the store
    pub transaction_hash: String,

    pub business_id: i64,

    /// Business this row belonged to before any merge (merge provenance)
    pub original_business_id: Option<i64>,

    pub card_last4: String,
    pub deal_date: NaiveDate,
    pub bank_charge_date: Option<NaiveDate>,
    pub charged_amount_ils: f64,
    pub original_amount: Option<f64>,
    pub original_currency: Option<String>,
    pub exchange_rate_used: Option<f64>,
    pub payment_type: PaymentType,
    pub kind: TransactionKind,
    pub installment_group_id: Option<String>,
    pub installment_index: Option<u32>,
    pub installment_total: Option<u32>,
    pub subscription_id: Option<i64>,
    pub status: TransactionStatus,
    pub projected_charge_date: Option<NaiveDate>,
    pub actual_charge_date: Option<NaiveDate>,
    pub is_refund: bool,
    pub source_file: Option<String>,
    pub upload_batch_id: Option<String>,
}

/// Insert payload - everything except the rowid the store assigns.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_hash: String,
    pub business_id: i64,
    pub card_last4: String,
    pub deal_date: NaiveDate,
    pub bank_charge_date: Option<NaiveDate>,
    pub charged_amount_ils: f64,
    pub original_amount: Option<f64>,
    pub original_currency: Option<String>,
    pub exchange_rate_used: Option<f64>,
    pub payment_type: PaymentType,
    pub kind: TransactionKind,
    pub installment_group_id: Option<String>,
    pub installment_index: Option<u32>,
    pub installment_total: Option<u32>,
    pub subscription_id: Option<i64>,
    pub status: TransactionStatus,
    pub projected_charge_date: Option<NaiveDate>,
    pub actual_charge_date: Option<NaiveDate>,
    pub is_refund: bool,
    pub source_file: Option<String>,
    pub upload_batch_id: Option<String>,
}

/// Result of an insert-if-absent by unique hash.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(i64),

    /// The unique hash constraint fired: this row is already stored.
    Duplicate,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS businesses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            normalized_name TEXT UNIQUE NOT NULL,
            display_name TEXT NOT NULL,
            category TEXT,
            approved INTEGER NOT NULL DEFAULT 0,
            merged_to_id INTEGER REFERENCES businesses(id),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_id INTEGER NOT NULL REFERENCES businesses(id),
            card_last4 TEXT NOT NULL,
            amount REAL NOT NULL,
            frequency TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_from_suggestion INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_hash TEXT UNIQUE NOT NULL,
            business_id INTEGER NOT NULL REFERENCES businesses(id),
            original_business_id INTEGER REFERENCES businesses(id),
            card_last4 TEXT NOT NULL,
            deal_date TEXT NOT NULL,
            bank_charge_date TEXT,
            charged_amount_ils REAL NOT NULL,
            original_amount REAL,
            original_currency TEXT,
            exchange_rate_used REAL,
            payment_type TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'regular',
            installment_group_id TEXT,
            installment_index INTEGER,
            installment_total INTEGER,
            subscription_id INTEGER REFERENCES subscriptions(id),
            status TEXT NOT NULL DEFAULT 'completed',
            projected_charge_date TEXT,
            actual_charge_date TEXT,
            is_refund INTEGER NOT NULL DEFAULT 0,
            source_file TEXT,
            upload_batch_id TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS merge_suggestions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_id_1 INTEGER NOT NULL REFERENCES businesses(id),
            business_id_2 INTEGER NOT NULL REFERENCES businesses(id),
            similarity_score REAL NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            rejected_until TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(business_id_1, business_id_2)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_hash ON transactions(transaction_hash)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_group ON transactions(installment_group_id, installment_index)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_business ON transactions(business_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_subscription ON transactions(subscription_id, status)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_date(s: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| rusqlite::Error::InvalidQuery)
}

fn parse_opt_date(s: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    s.map(parse_date).transpose()
}

const TX_COLUMNS: &str = "id, transaction_hash, business_id, original_business_id, card_last4,
    deal_date, bank_charge_date, charged_amount_ils, original_amount, original_currency,
    exchange_rate_used, payment_type, kind, installment_group_id, installment_index,
    installment_total, subscription_id, status, projected_charge_date, actual_charge_date,
    is_refund, source_file, upload_batch_id";

fn map_transaction(row: &Row) -> rusqlite::Result<Transaction> {
    let payment_type: String = row.get(11)?;
    let kind: String = row.get(12)?;
    let status: String = row.get(17)?;

    Ok(Transaction {
        id: row.get(0)?,
        transaction_hash: row.get(1)?,
        business_id: row.get(2)?,
        original_business_id: row.get(3)?,
        card_last4: row.get(4)?,
        deal_date: parse_date(row.get(5)?)?,
        bank_charge_date: parse_opt_date(row.get(6)?)?,
        charged_amount_ils: row.get(7)?,
        original_amount: row.get(8)?,
        original_currency: row.get(9)?,
        exchange_rate_used: row.get(10)?,
        payment_type: PaymentType::parse(&payment_type).ok_or(rusqlite::Error::InvalidQuery)?,
        kind: TransactionKind::parse(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
        installment_group_id: row.get(13)?,
        installment_index: row.get(14)?,
        installment_total: row.get(15)?,
        subscription_id: row.get(16)?,
        status: TransactionStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        projected_charge_date: parse_opt_date(row.get(18)?)?,
        actual_charge_date: parse_opt_date(row.get(19)?)?,
        is_refund: row.get(20)?,
        source_file: row.get(21)?,
        upload_batch_id: row.get(22)?,
    })
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn fmt_opt_date(d: Option<NaiveDate>) -> Option<String> {
    d.map(fmt_date)
}

// ============================================================================
// TRANSACTION OPERATIONS
// ============================================================================

/// Insert-if-absent by unique hash. The store's uniqueness constraint is the
/// arbiter: a violation means another row (possibly from a concurrent batch)
/// already claimed this identity.
pub fn insert_transaction(conn: &Connection, tx: &NewTransaction) -> Result<InsertOutcome> {
    let result = conn.execute(
        "INSERT INTO transactions (
            transaction_hash, business_id, card_last4, deal_date, bank_charge_date,
            charged_amount_ils, original_amount, original_currency, exchange_rate_used,
            payment_type, kind, installment_group_id, installment_index, installment_total,
            subscription_id, status, projected_charge_date, actual_charge_date,
            is_refund, source_file, upload_batch_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            tx.transaction_hash,
            tx.business_id,
            tx.card_last4,
            fmt_date(tx.deal_date),
            fmt_opt_date(tx.bank_charge_date),
            tx.charged_amount_ils,
            tx.original_amount,
            tx.original_currency,
            tx.exchange_rate_used,
            tx.payment_type.as_str(),
            tx.kind.as_str(),
            tx.installment_group_id,
            tx.installment_index,
            tx.installment_total,
            tx.subscription_id,
            tx.status.as_str(),
            fmt_opt_date(tx.projected_charge_date),
            fmt_opt_date(tx.actual_charge_date),
            tx.is_refund,
            tx.source_file,
            tx.upload_batch_id,
        ],
    );

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted(conn.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            debug!(hash = %tx.transaction_hash, "hash constraint fired, treating as duplicate");
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn transaction_hash_exists(conn: &Connection, hash: &str) -> Result<bool> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM transactions WHERE transaction_hash = ?1")?;
    Ok(stmt.exists([hash])?)
}

pub fn find_transaction_by_hash(conn: &Connection, hash: &str) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {TX_COLUMNS} FROM transactions WHERE transaction_hash = ?1");
    Ok(conn.query_row(&sql, [hash], map_transaction).optional()?)
}

pub fn get_transaction(conn: &Connection, id: i64) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1");
    let tx = conn
        .query_row(&sql, [id], map_transaction)
        .optional()?;
    Ok(tx)
}

pub fn all_transactions(conn: &Connection) -> Result<Vec<Transaction>> {
    let sql = format!("SELECT {TX_COLUMNS} FROM transactions ORDER BY deal_date, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All stored payments of an installment group at one index, any status.
pub fn find_group_members_at_index(
    conn: &Connection,
    group_id: &str,
    index: u32,
) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE installment_group_id = ?1 AND installment_index = ?2
         ORDER BY id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![group_id, index], map_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn find_group_members(conn: &Connection, group_id: &str) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE installment_group_id = ?1
         ORDER BY installment_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map([group_id], map_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Projected subscription rows that could be completed by a real charge of
/// `amount` around `date` on this business + card.
pub fn find_projected_subscription_candidates(
    conn: &Connection,
    business_id: i64,
    card_last4: &str,
    amount: f64,
    amount_tolerance: f64,
    date: NaiveDate,
    window_days: i64,
) -> Result<Vec<Transaction>> {
    let from = date - chrono::Duration::days(window_days);
    let to = date + chrono::Duration::days(window_days);
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE status = 'projected'
           AND subscription_id IS NOT NULL
           AND business_id = ?1
           AND card_last4 = ?2
           AND ABS(charged_amount_ils - ?3) <= ?4
           AND projected_charge_date BETWEEN ?5 AND ?6
         ORDER BY projected_charge_date"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![business_id, card_last4, amount, amount_tolerance, fmt_date(from), fmt_date(to)],
            map_transaction,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Complete a projected row in place with the real bank-reported values.
/// The row keeps its identity (same rowid); its hash is reconciled to the
/// incoming charge's hash so the next upload of the same statement
/// short-circuits to duplicate.
pub fn complete_projected(
    conn: &Connection,
    id: i64,
    new_hash: &str,
    charged_amount_ils: f64,
    actual_charge_date: NaiveDate,
    bank_charge_date: Option<NaiveDate>,
) -> Result<()> {
    conn.execute(
        "UPDATE transactions
         SET status = 'completed',
             transaction_hash = ?2,
             charged_amount_ils = ?3,
             actual_charge_date = ?4,
             bank_charge_date = COALESCE(?5, bank_charge_date)
         WHERE id = ?1",
        params![id, new_hash, charged_amount_ils, fmt_date(actual_charge_date), fmt_opt_date(bank_charge_date)],
    )?;
    Ok(())
}

/// Completed, non-subscription one-time charges - the recurrence detector's
/// input set.
pub fn completed_regular_charges(conn: &Connection) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions
         WHERE status = 'completed'
           AND kind = 'regular'
           AND payment_type = 'one_time'
           AND is_refund = 0
         ORDER BY business_id, card_last4, deal_date"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Delete transactions by id. If the selection removes some but not all
/// members of an installment group or subscription stream, the delete is
/// refused with the split listing unless `confirm_partial` is set.
pub fn delete_transactions(conn: &Connection, ids: &[i64], confirm_partial: bool) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    if !confirm_partial {
        let splits = detect_group_splits(conn, ids)?;
        if !splits.is_empty() {
            return Err(LedgerError::PartialGroupDeletion { splits });
        }
    }

    let placeholders = placeholders(ids.len());
    let sql = format!("DELETE FROM transactions WHERE id IN ({placeholders})");
    let deleted = conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
    Ok(deleted)
}

fn detect_group_splits(conn: &Connection, ids: &[i64]) -> Result<Vec<GroupSplit>> {
    let placeholders = placeholders(ids.len());
    let mut splits = Vec::new();

    // Installment groups touched by the selection
    let sql = format!(
        "SELECT installment_group_id,
                SUM(CASE WHEN id IN ({placeholders}) THEN 1 ELSE 0 END) AS selected,
                SUM(CASE WHEN id IN ({placeholders}) THEN 0 ELSE 1 END) AS remaining
         FROM transactions
         WHERE installment_group_id IS NOT NULL
         GROUP BY installment_group_id
         HAVING selected > 0 AND remaining > 0"
    );
    let mut stmt = conn.prepare(&sql)?;
    let doubled: Vec<i64> = ids.iter().chain(ids.iter()).copied().collect();
    let group_rows = stmt
        .query_map(rusqlite::params_from_iter(doubled.iter()), |row| {
            Ok(GroupSplit {
                group: row.get::<_, String>(0)?,
                selected: row.get::<_, i64>(1)? as usize,
                remaining: row.get::<_, i64>(2)? as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    splits.extend(group_rows);

    // Subscription streams touched by the selection
    let sql = format!(
        "SELECT subscription_id,
                SUM(CASE WHEN id IN ({placeholders}) THEN 1 ELSE 0 END) AS selected,
                SUM(CASE WHEN id IN ({placeholders}) THEN 0 ELSE 1 END) AS remaining
         FROM transactions
         WHERE subscription_id IS NOT NULL
         GROUP BY subscription_id
         HAVING selected > 0 AND remaining > 0"
    );
    let mut stmt = conn.prepare(&sql)?;
    let sub_rows = stmt
        .query_map(rusqlite::params_from_iter(doubled.iter()), |row| {
            Ok(GroupSplit {
                group: format!("subscription:{}", row.get::<_, i64>(0)?),
                selected: row.get::<_, i64>(1)? as usize,
                remaining: row.get::<_, i64>(2)? as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    splits.extend(sub_rows);

    Ok(splits)
}

pub(crate) fn placeholders(n: usize) -> String {
    let mut s = String::new();
    for i in 1..=n {
        if i > 1 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

// ============================================================================
// BUSINESS OPERATIONS
// ============================================================================

fn map_business(row: &Row) -> rusqlite::Result<Business> {
    Ok(Business {
        id: row.get(0)?,
        normalized_name: row.get(1)?,
        display_name: row.get(2)?,
        category: row.get(3)?,
        approved: row.get(4)?,
        merged_to_id: row.get(5)?,
    })
}

const BUSINESS_COLUMNS: &str =
    "id, normalized_name, display_name, category, approved, merged_to_id";

pub fn get_business(conn: &Connection, id: i64) -> Result<Option<Business>> {
    let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_business).optional()?)
}

pub fn find_business_by_normalized_name(
    conn: &Connection,
    normalized_name: &str,
) -> Result<Option<Business>> {
    let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE normalized_name = ?1");
    Ok(conn.query_row(&sql, [normalized_name], map_business).optional()?)
}

/// Resolve a raw statement business name to a business id, creating the
/// record on first sight. If the matched business was merged away, the
/// single-level pointer is followed to the active target (one hop only).
pub fn find_or_create_business(conn: &Connection, raw_name: &str) -> Result<i64> {
    let normalized = crate::ingest::normalize_business_name(raw_name);

    if let Some(business) = find_business_by_normalized_name(conn, &normalized)? {
        return Ok(business.merged_to_id.unwrap_or(business.id));
    }

    conn.execute(
        "INSERT INTO businesses (normalized_name, display_name) VALUES (?1, ?2)",
        params![normalized, raw_name.trim()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// All businesses that have not been merged away.
pub fn active_businesses(conn: &Connection) -> Result<Vec<Business>> {
    let sql = format!(
        "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE merged_to_id IS NULL ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_business)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Businesses merged into the given target.
pub fn merged_sources(conn: &Connection, target_id: i64) -> Result<Vec<Business>> {
    let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE merged_to_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([target_id], map_business)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_transactions_for_business(conn: &Connection, business_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE business_id = ?1",
        [business_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Optional filters for the business listing. Every condition is bound as a
/// parameter - no string-built WHERE clauses.
#[derive(Debug, Clone, Default)]
pub struct BusinessFilter {
    pub approved: Option<bool>,
    pub category: Option<String>,
    pub name_contains: Option<String>,
    pub include_merged: bool,
}

pub fn list_businesses(conn: &Connection, filter: &BusinessFilter) -> Result<Vec<Business>> {
    let mut conditions: Vec<&str> = Vec::new();
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if !filter.include_merged {
        conditions.push("merged_to_id IS NULL");
    }
    if let Some(approved) = filter.approved {
        conditions.push("approved = ?");
        params_vec.push(Box::new(approved));
    }
    if let Some(ref category) = filter.category {
        conditions.push("category = ?");
        params_vec.push(Box::new(category.clone()));
    }
    if let Some(ref fragment) = filter.name_contains {
        conditions.push("normalized_name LIKE '%' || ? || '%'");
        params_vec.push(Box::new(fragment.to_lowercase()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses {where_clause} ORDER BY id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            map_business,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ============================================================================
// SUBSCRIPTION OPERATIONS
// ============================================================================

fn map_subscription(row: &Row) -> rusqlite::Result<Subscription> {
    let frequency: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(Subscription {
        id: row.get(0)?,
        business_id: row.get(1)?,
        card_last4: row.get(2)?,
        amount: row.get(3)?,
        frequency: Frequency::parse(&frequency).ok_or(rusqlite::Error::InvalidQuery)?,
        start_date: parse_date(row.get(5)?)?,
        end_date: parse_opt_date(row.get(6)?)?,
        status: SubscriptionStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        created_from_suggestion: row.get(8)?,
    })
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, business_id, card_last4, amount, frequency, start_date, end_date, status, created_from_suggestion";

pub struct NewSubscription {
    pub business_id: i64,
    pub card_last4: String,
    pub amount: f64,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub created_from_suggestion: bool,
}

pub fn insert_subscription(conn: &Connection, sub: &NewSubscription) -> Result<i64> {
    conn.execute(
        "INSERT INTO subscriptions (business_id, card_last4, amount, frequency, start_date, end_date, status, created_from_suggestion)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)",
        params![
            sub.business_id,
            sub.card_last4,
            sub.amount,
            sub.frequency.as_str(),
            fmt_date(sub.start_date),
            fmt_opt_date(sub.end_date),
            sub.created_from_suggestion,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_subscription(conn: &Connection, id: i64) -> Result<Option<Subscription>> {
    let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_subscription).optional()?)
}

pub fn update_subscription_status(
    conn: &Connection,
    id: i64,
    status: SubscriptionStatus,
    end_date: Option<NaiveDate>,
) -> Result<()> {
    conn.execute(
        "UPDATE subscriptions SET status = ?2, end_date = COALESCE(?3, end_date) WHERE id = ?1",
        params![id, status.as_str(), fmt_opt_date(end_date)],
    )?;
    Ok(())
}

/// Attach pre-existing transactions to a subscription (caller backfill).
pub fn link_transactions_to_subscription(
    conn: &Connection,
    subscription_id: i64,
    transaction_ids: &[i64],
) -> Result<usize> {
    if transaction_ids.is_empty() {
        return Ok(0);
    }
    let ph = placeholders(transaction_ids.len());
    let sql = format!(
        "UPDATE transactions SET subscription_id = ?, kind = 'subscription' WHERE id IN ({ph})"
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(subscription_id)];
    for id in transaction_ids {
        params_vec.push(Box::new(*id));
    }
    let updated = conn.execute(
        &sql,
        rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
    )?;
    Ok(updated)
}

pub fn transactions_for_subscription(
    conn: &Connection,
    subscription_id: i64,
) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {TX_COLUMNS} FROM transactions WHERE subscription_id = ?1 ORDER BY deal_date, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([subscription_id], map_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Mark a cancelled subscription's still-pending projections as cancelled.
/// Completed history stays untouched.
pub fn cancel_future_projections(
    conn: &Connection,
    subscription_id: i64,
    from: NaiveDate,
) -> Result<usize> {
    let cancelled = conn.execute(
        "UPDATE transactions
         SET status = 'cancelled'
         WHERE subscription_id = ?1
           AND status = 'projected'
           AND projected_charge_date >= ?2",
        params![subscription_id, fmt_date(from)],
    )?;
    Ok(cancelled)
}

// ============================================================================
// MERGE SUGGESTION OPERATIONS
// ============================================================================

fn map_suggestion(row: &Row) -> rusqlite::Result<MergeSuggestion> {
    let status: String = row.get(5)?;
    let rejected_until: Option<String> = row.get(6)?;
    let rejected_until = rejected_until
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| rusqlite::Error::InvalidQuery)
        })
        .transpose()?;

    Ok(MergeSuggestion {
        id: row.get(0)?,
        business_id_1: row.get(1)?,
        business_id_2: row.get(2)?,
        similarity_score: row.get(3)?,
        reason: row.get(4)?,
        status: SuggestionStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        rejected_until,
    })
}

const SUGGESTION_COLUMNS: &str =
    "id, business_id_1, business_id_2, similarity_score, reason, status, rejected_until";

/// Look up the suggestion for a pair, order-insensitive.
pub fn find_suggestion_for_pair(
    conn: &Connection,
    business_id_a: i64,
    business_id_b: i64,
) -> Result<Option<MergeSuggestion>> {
    let (lo, hi) = if business_id_a <= business_id_b {
        (business_id_a, business_id_b)
    } else {
        (business_id_b, business_id_a)
    };
    let sql = format!(
        "SELECT {SUGGESTION_COLUMNS} FROM merge_suggestions
         WHERE business_id_1 = ?1 AND business_id_2 = ?2"
    );
    Ok(conn.query_row(&sql, params![lo, hi], map_suggestion).optional()?)
}

/// Insert a pending suggestion; the pair is stored in (low, high) id order
/// so the unique constraint is order-insensitive too.
pub fn insert_suggestion(
    conn: &Connection,
    business_id_a: i64,
    business_id_b: i64,
    similarity_score: f64,
    reason: &str,
) -> Result<i64> {
    let (lo, hi) = if business_id_a <= business_id_b {
        (business_id_a, business_id_b)
    } else {
        (business_id_b, business_id_a)
    };
    conn.execute(
        "INSERT INTO merge_suggestions (business_id_1, business_id_2, similarity_score, reason, status)
         VALUES (?1, ?2, ?3, ?4, 'pending')",
        params![lo, hi, similarity_score, reason],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_suggestion(conn: &Connection, id: i64) -> Result<Option<MergeSuggestion>> {
    let sql = format!("SELECT {SUGGESTION_COLUMNS} FROM merge_suggestions WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], map_suggestion).optional()?)
}

pub fn pending_suggestions(conn: &Connection) -> Result<Vec<MergeSuggestion>> {
    let sql = format!(
        "SELECT {SUGGESTION_COLUMNS} FROM merge_suggestions WHERE status = 'pending' ORDER BY similarity_score DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], map_suggestion)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn mark_suggestion_rejected(
    conn: &Connection,
    id: i64,
    rejected_until: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE merge_suggestions SET status = 'rejected', rejected_until = ?2 WHERE id = ?1",
        params![id, rejected_until.to_rfc3339()],
    )?;
    if updated == 0 {
        return Err(LedgerError::InvalidMergeRequest(format!(
            "suggestion {id} not found"
        )));
    }
    Ok(())
}

/// Drop every suggestion that references any of the given businesses.
pub fn delete_suggestions_referencing(conn: &Connection, business_ids: &[i64]) -> Result<usize> {
    if business_ids.is_empty() {
        return Ok(0);
    }
    let ph = placeholders(business_ids.len());
    let sql = format!(
        "DELETE FROM merge_suggestions WHERE business_id_1 IN ({ph}) OR business_id_2 IN ({ph})"
    );
    let doubled: Vec<i64> = business_ids.iter().chain(business_ids.iter()).copied().collect();
    let deleted = conn.execute(&sql, rusqlite::params_from_iter(doubled.iter()))?;
    Ok(deleted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_tx(hash: &str, business_id: i64) -> NewTransaction {
        NewTransaction {
            transaction_hash: hash.to_string(),
            business_id,
            card_last4: "4521".to_string(),
            deal_date: date(2025, 3, 14),
            bank_charge_date: None,
            charged_amount_ils: 89.90,
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
            source_file: Some("test.csv".to_string()),
            upload_batch_id: None,
        }
    }

    #[test]
    fn test_insert_and_fetch_round_trip() {
        let conn = test_conn();
        let business_id = find_or_create_business(&conn, "Super-Pharm").unwrap();

        let outcome = insert_transaction(&conn, &new_tx("abc123", business_id)).unwrap();
        let id = match outcome {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => panic!("first insert must not be a duplicate"),
        };

        let stored = get_transaction(&conn, id).unwrap().unwrap();
        assert_eq!(stored.transaction_hash, "abc123");
        assert_eq!(stored.business_id, business_id);
        assert_eq!(stored.deal_date, date(2025, 3, 14));
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(stored.payment_type, PaymentType::OneTime);
    }

    #[test]
    fn test_unique_hash_constraint_recovered_as_duplicate() {
        let conn = test_conn();
        let business_id = find_or_create_business(&conn, "Super-Pharm").unwrap();

        let first = insert_transaction(&conn, &new_tx("samehash", business_id)).unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = insert_transaction(&conn, &new_tx("samehash", business_id)).unwrap();
        assert_eq!(second, InsertOutcome::Duplicate, "constraint violation must become Duplicate");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_find_or_create_business_is_idempotent() {
        let conn = test_conn();
        let id1 = find_or_create_business(&conn, "  Super-Pharm ").unwrap();
        let id2 = find_or_create_business(&conn, "SUPER-PHARM").unwrap();
        assert_eq!(id1, id2, "same normalized name resolves to same business");

        let business = get_business(&conn, id1).unwrap().unwrap();
        assert_eq!(business.normalized_name, "super-pharm");
        assert_eq!(business.display_name, "Super-Pharm");
    }

    #[test]
    fn test_find_or_create_follows_merge_pointer_one_hop() {
        let conn = test_conn();
        let source = find_or_create_business(&conn, "SuperPharm").unwrap();
        let target = find_or_create_business(&conn, "Super-Pharm").unwrap();
        conn.execute(
            "UPDATE businesses SET merged_to_id = ?1 WHERE id = ?2",
            params![target, source],
        )
        .unwrap();

        let resolved = find_or_create_business(&conn, "SuperPharm").unwrap();
        assert_eq!(resolved, target, "merged-away names resolve to the merge target");
    }

    #[test]
    fn test_group_member_lookup() {
        let conn = test_conn();
        let business_id = find_or_create_business(&conn, "Ace Hardware").unwrap();

        let mut tx = new_tx("p1", business_id);
        tx.payment_type = PaymentType::Installments;
        tx.installment_group_id = Some("groupA".to_string());
        tx.installment_index = Some(1);
        tx.installment_total = Some(12);
        insert_transaction(&conn, &tx).unwrap();

        let mut tx2 = new_tx("p2", business_id);
        tx2.payment_type = PaymentType::Installments;
        tx2.installment_group_id = Some("groupA".to_string());
        tx2.installment_index = Some(2);
        tx2.installment_total = Some(12);
        insert_transaction(&conn, &tx2).unwrap();

        assert_eq!(find_group_members(&conn, "groupA").unwrap().len(), 2);
        assert_eq!(find_group_members_at_index(&conn, "groupA", 2).unwrap().len(), 1);
        assert!(find_group_members_at_index(&conn, "groupA", 3).unwrap().is_empty());
    }

    #[test]
    fn test_complete_projected_updates_in_place() {
        let conn = test_conn();
        let business_id = find_or_create_business(&conn, "Netflix").unwrap();

        let mut tx = new_tx("projhash", business_id);
        tx.status = TransactionStatus::Projected;
        tx.projected_charge_date = Some(date(2025, 4, 1));
        let id = match insert_transaction(&conn, &tx).unwrap() {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => unreachable!(),
        };

        complete_projected(&conn, id, "realhash", 41.90, date(2025, 4, 3), Some(date(2025, 4, 3))).unwrap();

        let stored = get_transaction(&conn, id).unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(stored.transaction_hash, "realhash");
        assert_eq!(stored.charged_amount_ils, 41.90);
        assert_eq!(stored.actual_charge_date, Some(date(2025, 4, 3)));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1, "completion must not create a second row");
    }

    #[test]
    fn test_delete_transactions_refuses_partial_group() {
        let conn = test_conn();
        let business_id = find_or_create_business(&conn, "Ace Hardware").unwrap();

        let mut ids = Vec::new();
        for i in 1..=3u32 {
            let mut tx = new_tx(&format!("pay{i}"), business_id);
            tx.payment_type = PaymentType::Installments;
            tx.installment_group_id = Some("groupB".to_string());
            tx.installment_index = Some(i);
            tx.installment_total = Some(3);
            match insert_transaction(&conn, &tx).unwrap() {
                InsertOutcome::Inserted(id) => ids.push(id),
                InsertOutcome::Duplicate => unreachable!(),
            }
        }

        // Deleting one of three must be refused with the split listed
        let err = delete_transactions(&conn, &ids[..1], false).unwrap_err();
        match err {
            LedgerError::PartialGroupDeletion { splits } => {
                assert_eq!(splits.len(), 1);
                assert_eq!(splits[0].selected, 1);
                assert_eq!(splits[0].remaining, 2);
            }
            other => panic!("expected PartialGroupDeletion, got {other:?}"),
        }

        // Explicit confirmation goes through
        assert_eq!(delete_transactions(&conn, &ids[..1], true).unwrap(), 1);

        // Deleting the whole group needs no confirmation
        assert_eq!(delete_transactions(&conn, &ids[1..], false).unwrap(), 2);
    }

    #[test]
    fn test_suggestion_pair_is_order_insensitive() {
        let conn = test_conn();
        let a = find_or_create_business(&conn, "SuperPharm").unwrap();
        let b = find_or_create_business(&conn, "Super-Pharm").unwrap();

        insert_suggestion(&conn, b, a, 0.9, "similar names").unwrap();

        assert!(find_suggestion_for_pair(&conn, a, b).unwrap().is_some());
        assert!(find_suggestion_for_pair(&conn, b, a).unwrap().is_some());
    }

    #[test]
    fn test_list_businesses_parameterized_filters() {
        let conn = test_conn();
        let a = find_or_create_business(&conn, "Super-Pharm").unwrap();
        find_or_create_business(&conn, "McDonald's").unwrap();
        conn.execute("UPDATE businesses SET approved = 1 WHERE id = ?1", [a]).unwrap();

        let approved = list_businesses(
            &conn,
            &BusinessFilter { approved: Some(true), ..Default::default() },
        )
        .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].id, a);

        let named = list_businesses(
            &conn,
            &BusinessFilter { name_contains: Some("PHARM".to_string()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(named.len(), 1, "LIKE filter is case-normalized and parameterized");
    }
}
