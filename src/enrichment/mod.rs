// ✨ Enrichment - post-merge passes over the final transaction list
// Passes only fill empty fields; confidence may only go up.

pub mod classifier;
pub mod fx;
pub mod iof;
pub mod metadata;
pub mod pipeline;
pub mod template;
pub mod totals;

pub use classifier::{CategoryPredictor, MerchantCityExtractor, RuleClassifier};
pub use pipeline::{EnrichmentPipeline, EnrichmentReport};

use rust_decimal::Decimal;

/// Raw statement text handed to the text-driven passes
#[derive(Debug, Clone, Default)]
pub struct StatementText {
    pub text: String,
}

impl StatementText {
    pub fn new(text: impl Into<String>) -> Self {
        StatementText { text: text.into() }
    }

    /// Trimmed, non-empty lines
    pub fn lines(&self) -> Vec<String> {
        self.text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Tolerance used when matching statement lines to transactions
pub fn match_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

pub fn amounts_match(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= match_tolerance()
}
