// 🔗 Enrichment Pipeline - fixed pass order over the merged transactions
//
//   template → fx → iof → metadata → classifier → totals → completeness bonus
//
// Text-driven passes (template, fx, totals) only run when statement text is
// available. Re-running the pipeline on its own output changes nothing.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::classifier::{ClassifierPass, RuleClassifier};
use super::fx::FxParser;
use super::iof::IofCalculator;
use super::metadata::MetadataEnricher;
use super::template::TemplateMatcher;
use super::totals::{TotalsReport, TotalsValidator};
use super::StatementText;
use crate::aggregate::aggregate_confidence;
use crate::config::EnsembleConfig;
use crate::model::{EnsembleResult, Transaction, OPTIONAL_FIELD_COUNT};

/// Upper bound of the completeness bonus
const MAX_COMPLETENESS_BONUS: f64 = 0.2;

/// What each pass did during one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub skipped: bool,
    pub fx_attached: usize,
    pub iof_filled: usize,
    pub categories_filled: usize,
    pub cities_filled: usize,
    pub classifier_failures: usize,
    pub totals: TotalsReport,
    pub completeness_ratio: f64,
    pub completeness_bonus: f64,
}

pub struct EnrichmentPipeline {
    template: TemplateMatcher,
    fx: FxParser,
    iof: IofCalculator,
    metadata: MetadataEnricher,
    classifier: ClassifierPass,
    totals: TotalsValidator,
}

impl EnrichmentPipeline {
    pub fn new() -> Self {
        EnrichmentPipeline {
            template: TemplateMatcher::new(),
            fx: FxParser::new(),
            iof: IofCalculator::new(),
            metadata: MetadataEnricher::new(),
            classifier: ClassifierPass::new(),
            totals: TotalsValidator::new(),
        }
    }

    /// Tolerances and classifier rules from config. An unreadable rules file
    /// disables the classifier pass instead of failing.
    pub fn from_config(config: &EnsembleConfig) -> Self {
        let mut pipeline = Self::new();
        pipeline.totals = TotalsValidator::with_tolerance(config.statement_total_tolerance);

        if let Some(path) = &config.classifier_rules {
            match RuleClassifier::from_file(path) {
                Ok(rules) => {
                    info!(rules = rules.rule_count(), path = %path.display(), "Classifier rules loaded");
                    pipeline.classifier = ClassifierPass::from_rules(rules);
                }
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Classifier disabled"),
            }
        }

        pipeline
    }

    pub fn with_classifier(mut self, classifier: ClassifierPass) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn enrich(&self, result: &mut EnsembleResult, statement: Option<&StatementText>) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        if result.final_transactions.is_empty() {
            report.skipped = true;
            return report;
        }

        let statement = statement.filter(|s| !s.is_empty());
        let transactions = &mut result.final_transactions;

        if let Some(text) = statement {
            let metadata = self.template.apply(transactions, text);
            if !metadata.is_empty() {
                result.statement = Some(metadata);
            }
            report.fx_attached = self.fx.apply(transactions, text);
        }

        report.iof_filled = self.iof.apply(transactions);
        self.metadata.apply(transactions);

        if !self.classifier.is_empty() {
            let stats = self.classifier.apply(transactions);
            report.categories_filled = stats.categories_filled;
            report.cities_filled = stats.cities_filled;
            report.classifier_failures = stats.failures;
        }

        if let Some(text) = statement {
            report.totals = self.totals.validate(transactions, &text.text);
            result.validation_flags.extend(report.totals.flags());
        }

        report.completeness_ratio = completeness_ratio(&result.final_transactions);
        report.completeness_bonus = completeness_bonus(report.completeness_ratio);

        // Recomputed from the outcomes so a second run lands on the same value
        let base = aggregate_confidence(&result.outcomes, &result.final_transactions);
        result.confidence = (base + report.completeness_bonus).min(1.0);

        info!(
            transactions = result.final_transactions.len(),
            fx = report.fx_attached,
            iof = report.iof_filled,
            categories = report.categories_filled,
            completeness = report.completeness_ratio,
            confidence = result.confidence,
            "Enrichment complete"
        );
        report
    }
}

impl Default for EnrichmentPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Filled optional fields over all possible optional fields
pub fn completeness_ratio(transactions: &[Transaction]) -> f64 {
    if transactions.is_empty() {
        return 0.0;
    }
    let filled: usize = transactions.iter().map(|t| t.optional_fields_filled()).sum();
    filled as f64 / (OPTIONAL_FIELD_COUNT * transactions.len()) as f64
}

pub fn completeness_bonus(ratio: f64) -> f64 {
    (ratio * MAX_COMPLETENESS_BONUS).min(MAX_COMPLETENESS_BONUS)
}
