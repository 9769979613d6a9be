// ⚖️ Statement Totals Validation - printed totals vs merged transactions
// Relative tolerance per split: |expected − actual| / expected ≤ tolerance.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::model::{parse_amount, Transaction};

static RE_TOTAL_NATIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)TOTAL\s+NACIONAL.*?R\$\s*([\d.,]+)").expect("national total regex"));
static RE_TOTAL_INTERNATIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)TOTAL\s+INTERNACIONAL.*?R\$\s*([\d.,]+)").expect("international total regex")
});
static RE_TOTAL_GRAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)TOTAL\s+GERAL.*?R\$\s*([\d.,]+)").expect("grand total regex"));

// ============================================================================
// SPLITS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalSplit {
    National,
    International,
    Grand,
}

impl TotalSplit {
    pub const ALL: [TotalSplit; 3] = [TotalSplit::National, TotalSplit::International, TotalSplit::Grand];

    /// Key used in EnsembleResult.validation_flags
    pub fn flag(&self) -> &'static str {
        match self {
            TotalSplit::National => "national",
            TotalSplit::International => "international",
            TotalSplit::Grand => "grand",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            TotalSplit::National => &RE_TOTAL_NATIONAL,
            TotalSplit::International => &RE_TOTAL_INTERNATIONAL,
            TotalSplit::Grand => &RE_TOTAL_GRAND,
        }
    }

    fn includes(&self, tx: &Transaction) -> bool {
        match self {
            TotalSplit::National => !tx.is_foreign_currency(),
            TotalSplit::International => tx.is_foreign_currency(),
            TotalSplit::Grand => true,
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalsCheck {
    pub split: TotalSplit,
    pub expected: Decimal,
    pub actual: Decimal,
    pub matched: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalsReport {
    pub checks: Vec<TotalsCheck>,
}

impl TotalsReport {
    pub fn flags(&self) -> BTreeMap<String, bool> {
        self.checks
            .iter()
            .map(|c| (c.split.flag().to_string(), c.matched))
            .collect()
    }

    pub fn all_matched(&self) -> bool {
        self.checks.iter().all(|c| c.matched)
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct TotalsValidator {
    /// Relative tolerance (default 5%)
    pub tolerance: Decimal,
}

impl TotalsValidator {
    pub fn new() -> Self {
        TotalsValidator {
            tolerance: Decimal::new(5, 2),
        }
    }

    pub fn with_tolerance(tolerance: Decimal) -> Self {
        TotalsValidator { tolerance }
    }

    /// Printed totals found in the statement text
    pub fn extract_totals(&self, text: &str) -> BTreeMap<TotalSplit, Decimal> {
        let mut totals = BTreeMap::new();
        for split in TotalSplit::ALL {
            let Some(c) = split.pattern().captures(text) else { continue };
            match parse_amount(&c[1]) {
                Ok(amount) => {
                    totals.insert(split, amount.abs());
                }
                Err(e) => warn!(split = split.flag(), error = %e, "Unreadable statement total"),
            }
        }
        totals
    }

    /// Expected zero only matches an actual zero
    pub fn within_tolerance(&self, expected: Decimal, actual: Decimal) -> bool {
        if expected.is_zero() {
            return actual.is_zero();
        }
        (expected - actual).abs() / expected <= self.tolerance
    }

    pub fn validate(&self, transactions: &[Transaction], text: &str) -> TotalsReport {
        let checks: Vec<TotalsCheck> = self
            .extract_totals(text)
            .into_iter()
            .map(|(split, expected)| {
                let actual: Decimal = transactions
                    .iter()
                    .filter(|t| split.includes(t))
                    .map(|t| t.amount.abs())
                    .sum();
                TotalsCheck {
                    split,
                    expected,
                    actual,
                    matched: self.within_tolerance(expected, actual),
                }
            })
            .collect();

        for check in &checks {
            debug!(
                split = check.split.flag(),
                expected = %check.expected,
                actual = %check.actual,
                matched = check.matched,
                "Statement total checked"
            );
        }

        TotalsReport { checks }
    }
}

impl Default for TotalsValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tx(cents: i64, currency: Option<&str>) -> Transaction {
        let mut t = Transaction::new(NaiveDate::from_ymd_opt(2024, 10, 5).unwrap(), "X", Decimal::new(cents, 2));
        t.currency_orig = currency.map(str::to_string);
        t
    }

    #[test]
    fn test_extract_totals() {
        let text = "TOTAL NACIONAL ..... R$ 1.234,56\nTotal Internacional R$ 218,50\nTOTAL GERAL R$1.453,06";
        let totals = TotalsValidator::new().extract_totals(text);
        assert_eq!(totals[&TotalSplit::National], Decimal::new(123456, 2));
        assert_eq!(totals[&TotalSplit::International], Decimal::new(21850, 2));
        assert_eq!(totals[&TotalSplit::Grand], Decimal::new(145306, 2));
    }

    #[test]
    fn test_validate_splits() {
        let transactions = vec![
            tx(100000, Some("BRL")),
            tx(-20000, None),
            tx(21850, Some("USD")),
        ];
        let text = "TOTAL NACIONAL R$ 1.200,00\nTOTAL INTERNACIONAL R$ 300,00\nTOTAL GERAL R$ 1.418,50";

        let report = TotalsValidator::new().validate(&transactions, text);
        let flags = report.flags();

        assert_eq!(flags.get("national"), Some(&true));
        assert_eq!(flags.get("international"), Some(&false));
        assert_eq!(flags.get("grand"), Some(&true));
        assert!(!report.all_matched());
    }

    #[test]
    fn test_zero_expected_total() {
        let validator = TotalsValidator::new();
        assert!(validator.within_tolerance(Decimal::ZERO, Decimal::ZERO));
        assert!(!validator.within_tolerance(Decimal::ZERO, Decimal::new(1, 2)));
    }

    #[test]
    fn test_no_totals_no_flags() {
        let report = TotalsValidator::new().validate(&[tx(100, None)], "no totals printed");
        assert!(report.checks.is_empty());
        assert!(report.flags().is_empty());
    }
}
