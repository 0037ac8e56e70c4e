// 📥 Statement Row Model - the contract with bank-format parsers
// Parsers (out of scope here) hand the core pre-parsed rows; this module
// defines that row shape plus a CSV adapter for the import binary and tests.

use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

// ============================================================================
// PAYMENT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Single charge settled in one billing cycle
    OneTime,

    /// One payment out of a multi-payment purchase
    Installments,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::OneTime => "one_time",
            PaymentType::Installments => "installments",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentType> {
        match s {
            "one_time" => Some(PaymentType::OneTime),
            "installments" => Some(PaymentType::Installments),
            _ => None,
        }
    }
}

// ============================================================================
// STATEMENT ROW
// ============================================================================

/// One parsed statement line, as handed over by a bank-format parser.
///
/// Dates are business dates (`deal_date` is when the purchase happened,
/// `bank_charge_date` is when the bank settled it). Amounts are ILS after
/// the parser's currency conversion; the original amount/currency ride along
/// for provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementRow {
    pub business_name: String,
    pub deal_date: NaiveDate,
    pub charged_amount_ils: f64,

    #[serde(default)]
    pub original_amount: Option<f64>,
    #[serde(default)]
    pub original_currency: Option<String>,
    #[serde(default)]
    pub exchange_rate_used: Option<f64>,

    pub card_last4: String,
    pub payment_type: PaymentType,

    /// 1-based position within the installment plan; absent for one-time.
    #[serde(default)]
    pub installment_index: Option<u32>,
    #[serde(default)]
    pub installment_total: Option<u32>,

    /// Full purchase sum as reported by the statement. Installment plans
    /// with an uneven first payment need this; when absent the group hash
    /// falls back to `charged_amount_ils * installment_total`.
    #[serde(default)]
    pub total_amount: Option<f64>,

    #[serde(default)]
    pub is_refund: bool,

    #[serde(default)]
    pub bank_charge_date: Option<NaiveDate>,

    #[serde(default)]
    pub source_file: Option<String>,

    /// Set by the batch ingester; not part of the parser contract.
    #[serde(skip)]
    pub upload_batch_hint: Option<String>,
}

impl StatementRow {
    /// Lowercased, trimmed business name - the canonical dedup key.
    pub fn normalized_business(&self) -> String {
        normalize_business_name(&self.business_name)
    }

    /// Validate the fields the classifier cannot work without.
    pub fn validate(&self) -> Result<()> {
        if self.business_name.trim().is_empty() {
            return Err(LedgerError::InvalidRow("missing business name".to_string()));
        }
        if self.payment_type == PaymentType::Installments {
            let index = self
                .installment_index
                .ok_or_else(|| LedgerError::InvalidRow("installment row without index".to_string()))?;
            let total = self
                .installment_total
                .ok_or_else(|| LedgerError::InvalidRow("installment row without total".to_string()))?;
            if index == 0 || total == 0 || index > total {
                return Err(LedgerError::InvalidRow(format!(
                    "installment index {index} out of range 1..{total}"
                )));
            }
        }
        Ok(())
    }

    /// Total purchase sum used for the group identity.
    pub fn group_total(&self) -> f64 {
        match (self.total_amount, self.installment_total) {
            (Some(total), _) => total,
            (None, Some(count)) => self.charged_amount_ils * count as f64,
            (None, None) => self.charged_amount_ils,
        }
    }
}

/// Normalize a business name to its canonical dedup key: lowercase + trim.
pub fn normalize_business_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ============================================================================
// CSV ADAPTER
// ============================================================================

/// Load pre-normalized statement rows from a CSV file.
///
/// This is NOT a bank-format parser - those live outside the core. It reads
/// the neutral row format above (serde field names as headers, dates as
/// `YYYY-MM-DD`) for the import binary and for test fixtures.
pub fn load_statement_rows(csv_path: &Path) -> anyhow::Result<Vec<StatementRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open statement CSV")?;

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let mut row: StatementRow = result.context("Failed to deserialize statement row")?;
        if row.source_file.is_none() {
            row.source_file = csv_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string());
        }
        rows.push(row);
    }

    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================
