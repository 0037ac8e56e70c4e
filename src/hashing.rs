// 🔑 Hashing Engine - Content-addressed transaction identities
// Pure, deterministic, no I/O. These are dedup identifiers, not security
// hashes - no secret, no salt.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::ingest::PaymentType;

// ============================================================================
// TRANSACTION HASH
// ============================================================================

/// Compute the content-addressed identity of a single charge or refund.
///
/// The amount is fixed to 2 decimals in string form before hashing so that
/// float noise (45.990000000001) can never split one logical charge into two
/// identities. `installment_index` is 0 for non-installment charges. The
/// refund flag is part of the input so a refund of a charge never collides
/// with the charge itself.
pub fn transaction_hash(
    normalized_business: &str,
    deal_date: NaiveDate,
    charged_amount_ils: f64,
    card_last4: &str,
    installment_index: u32,
    payment_type: PaymentType,
    is_refund: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{:.2}|{}|{}|{}|{}",
        normalized_business,
        deal_date.format("%Y-%m-%d"),
        charged_amount_ils,
        card_last4,
        installment_index,
        payment_type.as_str(),
        if is_refund { "refund" } else { "charge" },
    ));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// INSTALLMENT GROUP ID
// ============================================================================

/// Compute the identity of a multi-payment purchase group.
///
/// The card is deliberately NOT part of this hash: a purchase whose card is
/// reissued mid-sequence must keep reconciling into the same group. The deal
/// date here is the back-calculated date of payment 1, so two statements
/// describing the same purchase derive the same group id no matter which
/// payment each of them saw first.
pub fn installment_group_id(
    normalized_business: &str,
    total_payment_sum: f64,
    installment_total: u32,
    deal_date: NaiveDate,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{:.2}|{}|{}",
        normalized_business,
        total_payment_sum,
        installment_total,
        deal_date.format("%Y-%m-%d"),
    ));
    format!("{:x}", hasher.finalize())
}

/// Identity of one specific payment within an established group.
pub fn installment_payment_hash(group_id: &str, installment_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", group_id, installment_index));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_transaction_hash_deterministic() {
        let h1 = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.90,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );
        let h2 = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.90,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );

        assert_eq!(h1, h2, "Same inputs must produce the same hash");
        assert_eq!(h1.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_transaction_hash_amount_rounding_stability() {
        let h1 = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.90,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );
        let h2 = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.900000000001,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );

        assert_eq!(h1, h2, "Float noise within 2 decimals must not change the hash");
    }

    #[test]
    fn test_transaction_hash_field_sensitivity() {
        let base = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.90,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );

        let other_amount = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.91,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );
        let other_card = transaction_hash(
            "super-pharm",
            date(2025, 3, 14),
            89.90,
            "9876",
            0,
            PaymentType::OneTime,
            false,
        );
        let other_date = transaction_hash(
            "super-pharm",
            date(2025, 3, 15),
            89.90,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );

        assert_ne!(base, other_amount);
        assert_ne!(base, other_card);
        assert_ne!(base, other_date);
    }

    #[test]
    fn test_refund_never_collides_with_charge() {
        let charge = transaction_hash(
            "ikea",
            date(2025, 1, 2),
            499.00,
            "4521",
            0,
            PaymentType::OneTime,
            false,
        );
        let refund = transaction_hash(
            "ikea",
            date(2025, 1, 2),
            499.00,
            "4521",
            0,
            PaymentType::OneTime,
            true,
        );

        assert_ne!(charge, refund, "A refund must never share the charge's identity");
    }

    #[test]
    fn test_group_id_ignores_card() {
        // Same purchase reported through two different cards (reissue
        // mid-sequence) - the group id has no card input at all, so there is
        // nothing to diverge on. Verify the derivation is stable and that
        // each purchase attribute matters.
        let g1 = installment_group_id("ace hardware", 3600.0, 12, date(2024, 11, 3));
        let g2 = installment_group_id("ace hardware", 3600.0, 12, date(2024, 11, 3));
        assert_eq!(g1, g2);
        assert_eq!(g1.len(), 64);

        assert_ne!(g1, installment_group_id("ace hardware", 3600.0, 10, date(2024, 11, 3)));
        assert_ne!(g1, installment_group_id("ace hardware", 3500.0, 12, date(2024, 11, 3)));
        assert_ne!(g1, installment_group_id("ace hardware", 3600.0, 12, date(2024, 12, 3)));
    }

    #[test]
    fn test_installment_payment_hash_unique_per_index() {
        let group = installment_group_id("ace hardware", 3600.0, 12, date(2024, 11, 3));

        let p1 = installment_payment_hash(&group, 1);
        let p2 = installment_payment_hash(&group, 2);

        assert_eq!(p1, installment_payment_hash(&group, 1));
        assert_ne!(p1, p2, "Sibling payments must have distinct identities");
    }
}
