// 🏷️ Statistical Enrichment - category and merchant-city guessing
// Predictors are pre-trained black boxes behind two traits. Either may be
// absent; a failing prediction is logged and skipped.

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::model::Transaction;

/// Confidence boost factor applied to a predicted category's confidence
const CATEGORY_BOOST: f64 = 0.1;

// ============================================================================
// CAPABILITIES
// ============================================================================

pub trait CategoryPredictor: Send + Sync {
    /// (category, confidence) or None when nothing fits
    fn predict(&self, description: &str) -> Result<Option<(String, f64)>>;
}

pub trait MerchantCityExtractor: Send + Sync {
    /// (merchant, city); either may be unknown
    fn extract_city_merchant(&self, description: &str) -> Result<(Option<String>, Option<String>)>;
}

// ============================================================================
// RULE-BASED IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub id: String,

    /// Case-insensitive; `*` matches any run of characters. Without `*` the
    /// pattern matches as a substring.
    pub pattern: String,

    #[serde(default)]
    pub merchant: Option<String>,

    #[serde(default)]
    pub category: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    pub confidence: f64,

    /// Higher = tried first
    #[serde(default)]
    pub priority: i32,
}

impl ClassificationRule {
    pub fn matches(&self, text: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        let text = text.to_lowercase();

        if !pattern.contains('*') {
            return text.contains(&pattern);
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let (first, last) = (parts[0], parts[parts.len() - 1]);
        if !text.starts_with(first) || !text.ends_with(last) || text.len() < first.len() + last.len() {
            return false;
        }

        // Middle parts must appear in order between the anchors
        let mut rest = &text[first.len()..text.len() - last.len()];
        for part in &parts[1..parts.len() - 1] {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
        true
    }
}

/// First matching rule wins (rules kept sorted by priority, highest first)
pub struct RuleClassifier {
    rules: Vec<ClassificationRule>,
}

impl RuleClassifier {
    pub fn new() -> Self {
        RuleClassifier { rules: Vec::new() }
    }

    /// Load rules from a JSON array
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read rules file: {}", path.as_ref().display()))?;
        let rules: Vec<ClassificationRule> =
            serde_json::from_str(&content).context("Failed to parse rules JSON")?;
        Ok(Self::from_rules(rules))
    }

    pub fn from_rules(mut rules: Vec<ClassificationRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        RuleClassifier { rules }
    }

    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn first_match(&self, description: &str) -> Option<&ClassificationRule> {
        self.rules.iter().find(|r| r.matches(description))
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryPredictor for RuleClassifier {
    fn predict(&self, description: &str) -> Result<Option<(String, f64)>> {
        Ok(self
            .rules
            .iter()
            .filter(|r| r.category.is_some())
            .find(|r| r.matches(description))
            .and_then(|r| r.category.clone().map(|c| (c, r.confidence))))
    }
}

impl MerchantCityExtractor for RuleClassifier {
    fn extract_city_merchant(&self, description: &str) -> Result<(Option<String>, Option<String>)> {
        Ok(match self.first_match(description) {
            Some(rule) => (rule.merchant.clone(), rule.city.clone()),
            None => (None, None),
        })
    }
}

// ============================================================================
// ENRICHMENT PASS
// ============================================================================

#[derive(Default)]
pub struct ClassifierPass {
    pub category: Option<Box<dyn CategoryPredictor>>,
    pub city: Option<Box<dyn MerchantCityExtractor>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub categories_filled: usize,
    pub cities_filled: usize,
    pub failures: usize,
}

impl ClassifierPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one rule set for both capabilities
    pub fn from_rules(rules: RuleClassifier) -> Self {
        let rules = std::sync::Arc::new(rules);
        ClassifierPass {
            category: Some(Box::new(SharedRules(std::sync::Arc::clone(&rules)))),
            city: Some(Box::new(SharedRules(rules))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.city.is_none()
    }

    pub fn apply(&self, transactions: &mut [Transaction]) -> ClassifierStats {
        let mut stats = ClassifierStats::default();

        for tx in transactions.iter_mut() {
            if let (Some(predictor), None) = (&self.category, &tx.category) {
                match predictor.predict(&tx.description) {
                    Ok(Some((category, confidence))) => {
                        tx.category = Some(category);
                        tx.raise_confidence(tx.confidence + confidence * CATEGORY_BOOST);
                        stats.categories_filled += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(description = %tx.description, error = %e, "Category prediction failed");
                        stats.failures += 1;
                    }
                }
            }

            if let Some(extractor) = &self.city {
                match extractor.extract_city_merchant(&tx.description) {
                    Ok((_, Some(city))) if tx.merchant_city.is_none() => {
                        tx.merchant_city = Some(city);
                        stats.cities_filled += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(description = %tx.description, error = %e, "Merchant extraction failed");
                        stats.failures += 1;
                    }
                }
            }
        }

        debug!(
            categories = stats.categories_filled,
            cities = stats.cities_filled,
            failures = stats.failures,
            "Classifier pass applied"
        );
        stats
    }
}

struct SharedRules(std::sync::Arc<RuleClassifier>);

impl CategoryPredictor for SharedRules {
    fn predict(&self, description: &str) -> Result<Option<(String, f64)>> {
        self.0.predict(description)
    }
}

impl MerchantCityExtractor for SharedRules {
    fn extract_city_merchant(&self, description: &str) -> Result<(Option<String>, Option<String>)> {
        self.0.extract_city_merchant(description)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn rule(id: &str, pattern: &str, category: Option<&str>, city: Option<&str>, priority: i32) -> ClassificationRule {
        ClassificationRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            merchant: None,
            category: category.map(str::to_string),
            city: city.map(str::to_string),
            confidence: 0.9,
            priority,
        }
    }

    fn tx(description: &str) -> Transaction {
        Transaction::new(NaiveDate::from_ymd_opt(2024, 10, 5).unwrap(), description, Decimal::ONE)
            .with_confidence(0.5)
    }

    struct FailingPredictor;

    impl CategoryPredictor for FailingPredictor {
        fn predict(&self, _description: &str) -> Result<Option<(String, f64)>> {
            anyhow::bail!("model not loaded")
        }
    }

    #[test]
    fn test_wildcard_matching() {
        let r = rule("uber", "UBER*TRIP", None, None, 0);
        assert!(r.matches("UBER *TRIP"));
        assert!(r.matches("uber br trip"));
        assert!(!r.matches("TRIP UBER"));

        let middle = rule("m", "IFOOD*REST*SP", None, None, 0);
        assert!(middle.matches("IFOOD *RESTAURANTE SP"));
        assert!(!middle.matches("IFOOD SP"));

        let substring = rule("s", "netflix", None, None, 0);
        assert!(substring.matches("PAYPAL *NETFLIX.COM"));
    }

    #[test]
    fn test_priority_order() {
        let classifier = RuleClassifier::from_rules(vec![
            rule("general", "AMAZON*", Some("Shopping"), None, 1),
            rule("specific", "AMAZON PRIME*", Some("Streaming"), None, 100),
        ]);
        let (category, _) = classifier.predict("AMAZON PRIME VIDEO").unwrap().unwrap();
        assert_eq!(category, "Streaming");
        assert_eq!(classifier.rule_count(), 2);
    }

    #[test]
    fn test_pass_fills_and_boosts() {
        let classifier = RuleClassifier::from_rules(vec![
            rule("netflix", "NETFLIX*", Some("Streaming"), Some("SAO PAULO"), 0),
        ]);
        let pass = ClassifierPass::from_rules(classifier);

        let mut transactions = vec![tx("NETFLIX.COM"), tx("PADARIA")];
        transactions[0].merchant_city = Some("LOS GATOS".to_string());

        let stats = pass.apply(&mut transactions);

        assert_eq!(stats.categories_filled, 1);
        assert_eq!(stats.cities_filled, 0);
        assert_eq!(transactions[0].category.as_deref(), Some("Streaming"));
        assert!((transactions[0].confidence - 0.59).abs() < 1e-9);
        assert_eq!(transactions[0].merchant_city.as_deref(), Some("LOS GATOS"));
        assert_eq!(transactions[1].category, None);
    }

    #[test]
    fn test_failures_are_skipped() {
        let pass = ClassifierPass {
            category: Some(Box::new(FailingPredictor)),
            city: None,
        };
        let mut transactions = vec![tx("NETFLIX.COM")];
        let stats = pass.apply(&mut transactions);
        assert_eq!(stats.failures, 1);
        assert_eq!(transactions[0].category, None);
        assert_eq!(transactions[0].confidence, 0.5);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"[{"id":"spotify","pattern":"SPOTIFY*","category":"Streaming","confidence":0.95,"priority":5}]"#,
        )
        .unwrap();

        let classifier = RuleClassifier::from_file(&path).unwrap();
        assert_eq!(classifier.rule_count(), 1);
        assert!(classifier.predict("SPOTIFY P1").unwrap().is_some());
        assert!(RuleClassifier::from_file(dir.path().join("missing.json")).is_err());
    }
}
