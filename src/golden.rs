// 🥇 Golden References - loading, lookup and semantic comparison
//
// A golden file is a manually verified CSV (',' or ';' separated) with at
// least date, description and amount columns. Header names are matched
// case-insensitively against the usual Portuguese/English variants.

use anyhow::{Context as AnyhowContext, Result};
use chrono::{Datelike, NaiveDate};
use csv::StringRecord;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::EnsembleConfig;
use crate::error::EnsembleError;
use crate::model::{format_date, normalize_date, parse_amount, Transaction, ValidationResult};

/// Words ignored when comparing descriptions
const FILLER_WORDS: [&str; 11] = ["de", "da", "do", "em", "na", "no", "a", "o", "e", "para", "com"];

// ============================================================================
// LOADER
// ============================================================================

#[derive(Debug, Default)]
struct ColumnMap {
    date: Option<usize>,
    description: Option<usize>,
    amount: Option<usize>,
    category: Option<usize>,
    currency_orig: Option<usize>,
    merchant_city: Option<usize>,
    fx_rate: Option<usize>,
    card_last4: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Self {
        let mut map = ColumnMap::default();
        for (i, header) in headers.iter().enumerate() {
            let slot = match header.trim().to_lowercase().as_str() {
                "date" | "data" | "post_date" => &mut map.date,
                "description" | "descricao" | "descrição" | "desc_raw" => &mut map.description,
                "amount" | "amount_brl" | "valor" => &mut map.amount,
                "category" | "categoria" => &mut map.category,
                "currency_orig" => &mut map.currency_orig,
                "merchant_city" => &mut map.merchant_city,
                "fx_rate" => &mut map.fx_rate,
                "card_last4" => &mut map.card_last4,
                _ => continue,
            };
            slot.get_or_insert(i);
        }
        map
    }

    fn missing_required(&self) -> Vec<&'static str> {
        [("date", self.date), ("description", self.description), ("amount", self.amount)]
            .iter()
            .filter(|(_, idx)| idx.is_none())
            .map(|(name, _)| *name)
            .collect()
    }
}

fn detect_delimiter(path: &Path) -> Result<u8> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read golden file: {}", path.display()))?;
    let header = content.lines().next().unwrap_or_default();
    Ok(if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    })
}

/// Load a golden reference. Malformed rows are skipped; an unreadable file or
/// a missing required column is an error.
pub fn load_reference(path: &Path) -> Result<Vec<Transaction>> {
    let delimiter = detect_delimiter(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open golden file: {}", path.display()))?;

    let columns = ColumnMap::from_headers(reader.headers()?);
    let missing = columns.missing_required();
    if !missing.is_empty() {
        return Err(EnsembleError::Reference(format!(
            "{} lacks required column(s): {}",
            path.display(),
            missing.join(", ")
        ))
        .into());
    }

    let default_year = chrono::Utc::now().year();
    let mut transactions = Vec::new();
    let mut skipped = 0;

    for (line_num, record) in reader.records().enumerate() {
        let row = match record {
            Ok(record) => parse_row(&record, &columns, default_year),
            Err(e) => Err(e.to_string()),
        };
        match row {
            Ok(tx) => transactions.push(tx),
            Err(reason) => {
                skipped += 1;
                warn!(file = %path.display(), line = line_num + 2, reason = %reason, "Skipping golden row");
            }
        }
    }

    info!(file = %path.display(), transactions = transactions.len(), skipped, "Golden reference loaded");
    Ok(transactions)
}

fn parse_row(record: &StringRecord, columns: &ColumnMap, default_year: i32) -> std::result::Result<Transaction, String> {
    let get = |idx: Option<usize>| idx.and_then(|i| record.get(i)).map(str::trim).filter(|s| !s.is_empty());

    let raw_date = get(columns.date).ok_or("empty date")?;
    let date = normalize_date(raw_date, default_year).ok_or_else(|| format!("bad date '{}'", raw_date))?;
    let description = get(columns.description).unwrap_or_default();
    let raw_amount = get(columns.amount).unwrap_or_default();
    let amount = parse_amount(raw_amount).map_err(|e| e.to_string())?;

    let mut tx = Transaction::new(date, description, amount).with_confidence(1.0);
    tx.category = get(columns.category).map(str::to_string);
    tx.currency_orig = get(columns.currency_orig).map(str::to_string);
    tx.merchant_city = get(columns.merchant_city).map(str::to_string);
    tx.card_last4 = get(columns.card_last4).map(str::to_string);
    tx.fx_rate = get(columns.fx_rate)
        .map(|raw| Decimal::from_str(&raw.replace(',', ".")).map_err(|e| format!("bad fx rate '{}': {}", raw, e)))
        .transpose()?
        .filter(|rate| !rate.is_zero());
    tx.raw_text = Some(format!("Golden: {} | {} | {}", raw_date, description, raw_amount));
    Ok(tx)
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenSummary {
    pub transaction_count: usize,
    pub total_amount: Decimal,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub categories: Vec<String>,
}

pub fn golden_summary(transactions: &[Transaction]) -> GoldenSummary {
    let first = transactions.iter().map(|t| t.date).min();
    let last = transactions.iter().map(|t| t.date).max();
    let categories: BTreeSet<String> = transactions
        .iter()
        .filter_map(|t| t.category.clone())
        .filter(|c| !c.is_empty())
        .collect();

    GoldenSummary {
        transaction_count: transactions.len(),
        total_amount: transactions.iter().map(|t| t.amount).sum(),
        date_range: first.zip(last),
        categories: categories.into_iter().collect(),
    }
}

// ============================================================================
// LIBRARY
// ============================================================================

/// Every golden file of a directory, keyed by normalized document name
#[derive(Debug, Default)]
pub struct GoldenLibrary {
    references: BTreeMap<String, Vec<Transaction>>,
}

impl GoldenLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.csv` in `dir`. Files that fail to load are logged and left out.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read golden directory: {}", dir.display()))?;

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()).map_or(false, |e| e.eq_ignore_ascii_case("csv")))
            .collect();
        paths.sort();

        let mut library = GoldenLibrary::new();
        for path in paths {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            match load_reference(&path) {
                Ok(transactions) => library.insert(&stem, transactions),
                Err(e) => warn!(file = %path.display(), error = %format!("{:#}", e), "Golden file not loaded"),
            }
        }

        info!(dir = %dir.display(), references = library.len(), "Golden library loaded");
        Ok(library)
    }

    pub fn insert(&mut self, name: &str, transactions: Vec<Transaction>) {
        self.references.insert(document_key(name), transactions);
    }

    /// None means "no comparison possible"
    pub fn lookup(&self, document: &str) -> Option<&[Transaction]> {
        let found = self.references.get(&document_key(document)).map(Vec::as_slice);
        if found.is_none() {
            debug!(document, available = self.references.len(), "No golden reference");
        }
        found
    }

    pub fn names(&self) -> Vec<&str> {
        self.references.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn summary(&self) -> BTreeMap<String, GoldenSummary> {
        self.references
            .iter()
            .map(|(name, txs)| (name.clone(), golden_summary(txs)))
            .collect()
    }

    /// Compare against the named reference, if there is one
    pub fn validate(&self, document: &str, extracted: &[Transaction], validator: &GoldenValidator) -> Option<ValidationResult> {
        self.lookup(document).map(|golden| validator.compare(extracted, golden))
    }
}

/// "golden_Itau-2024-10.pdf" and "itau_2024_10" share a key
pub fn document_key(name: &str) -> String {
    let name = name.trim();
    let file_name = Path::new(name).file_name().and_then(|s| s.to_str()).unwrap_or(name);
    let lower = file_name.to_lowercase();
    let stem = lower
        .strip_suffix(".pdf")
        .or_else(|| lower.strip_suffix(".csv"))
        .unwrap_or(&lower);
    let stem = stem.strip_prefix("golden_").unwrap_or(stem);
    stem.replace('-', "_")
}

// ============================================================================
// SEMANTIC COMPARATOR
// ============================================================================

pub struct GoldenValidator {
    pub date_tolerance_days: i64,
    /// Per-field amount tolerance
    pub amount_tolerance: Decimal,
    /// Absolute tolerance on the total amount
    pub total_tolerance: Decimal,
    pub similarity_threshold: f64,
}

impl GoldenValidator {
    pub fn new() -> Self {
        GoldenValidator {
            date_tolerance_days: 1,
            amount_tolerance: Decimal::new(1, 2),
            total_tolerance: ValidationResult::amount_tolerance(),
            similarity_threshold: 0.70,
        }
    }

    pub fn from_config(config: &EnsembleConfig) -> Self {
        GoldenValidator {
            total_tolerance: config.golden_amount_tolerance,
            ..Self::new()
        }
    }

    pub fn compare(&self, extracted: &[Transaction], golden: &[Transaction]) -> ValidationResult {
        let matches = self.find_matches(extracted, golden);
        let tp = matches.len();
        let fp = extracted.len() - tp;
        let fn_ = golden.len() - tp;

        let ratio = |num: usize, den: usize| if den == 0 { 1.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            1.0
        };

        let mut total_cells = 0;
        let mut matching_cells = 0;
        let mut mismatches = Vec::new();

        for (i, j) in &matches {
            for (field, matched, got, expected) in self.compare_fields(&extracted[*i], &golden[*j]) {
                total_cells += 1;
                if matched {
                    matching_cells += 1;
                } else {
                    mismatches.push(format!("Row {}, {}: '{}' vs '{}'", i + 1, field, got, expected));
                }
            }
        }

        let matched_extracted: BTreeSet<usize> = matches.iter().map(|(i, _)| *i).collect();
        let matched_golden: BTreeSet<usize> = matches.iter().map(|(_, j)| *j).collect();
        for (i, tx) in extracted.iter().enumerate().filter(|(i, _)| !matched_extracted.contains(i)) {
            mismatches.push(format!("Row {} not in golden: {} {} {}", i + 1, format_date(tx.date), tx.description, tx.amount));
        }
        for tx in golden.iter().enumerate().filter(|(j, _)| !matched_golden.contains(j)).map(|(_, t)| t) {
            mismatches.push(format!("Missing from extraction: {} {} {}", format_date(tx.date), tx.description, tx.amount));
        }

        let extracted_total: Decimal = extracted.iter().map(|t| t.amount).sum();
        let golden_total: Decimal = golden.iter().map(|t| t.amount).sum();
        let amount_difference = (extracted_total - golden_total).abs();

        ValidationResult {
            cell_accuracy: ratio(matching_cells, total_cells),
            transaction_count_match: extracted.len() == golden.len(),
            total_amount_match: amount_difference <= self.total_tolerance,
            amount_difference,
            mismatches,
            precision,
            recall,
            f1_score,
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
        }
    }

    /// Exact-key pass, then best-similarity pass over what is left.
    /// Returns (extracted index, golden index) pairs.
    pub fn find_matches(&self, extracted: &[Transaction], golden: &[Transaction]) -> Vec<(usize, usize)> {
        let golden_keys: Vec<_> = golden.iter().map(comparison_key).collect();
        let mut used = vec![false; golden.len()];
        let mut matched = vec![false; extracted.len()];
        let mut matches = Vec::new();

        for (i, tx) in extracted.iter().enumerate() {
            let key = comparison_key(tx);
            if let Some(j) = (0..golden.len()).find(|j| !used[*j] && golden_keys[*j] == key) {
                used[j] = true;
                matched[i] = true;
                matches.push((i, j));
            }
        }

        for (i, tx) in extracted.iter().enumerate().filter(|(i, _)| !matched[*i]) {
            let mut best: Option<(usize, f64)> = None;
            for (j, candidate) in golden.iter().enumerate().filter(|(j, _)| !used[*j]) {
                let score = similarity(tx, candidate);
                if score >= self.similarity_threshold && best.map_or(true, |(_, s)| score > s) {
                    best = Some((j, score));
                }
            }
            if let Some((j, _)) = best {
                used[j] = true;
                matches.push((i, j));
            }
        }

        matches
    }

    /// (field, matched, extracted value, golden value)
    fn compare_fields(&self, a: &Transaction, b: &Transaction) -> Vec<(&'static str, bool, String, String)> {
        let mut fields = vec![
            (
                "date",
                (a.date - b.date).num_days().abs() <= self.date_tolerance_days,
                format_date(a.date),
                format_date(b.date),
            ),
            (
                "description",
                description_similarity(&a.description, &b.description) >= self.similarity_threshold,
                a.description.clone(),
                b.description.clone(),
            ),
            (
                "amount",
                (a.amount - b.amount).abs() <= self.amount_tolerance,
                a.amount.to_string(),
                b.amount.to_string(),
            ),
        ];

        if let (Some(ca), Some(cb)) = (a.category.as_deref().filter(|c| !c.is_empty()), b.category.as_deref().filter(|c| !c.is_empty())) {
            fields.push(("category", ca.to_lowercase() == cb.to_lowercase(), ca.to_string(), cb.to_string()));
        }
        fields
    }
}

impl Default for GoldenValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn comparison_key(tx: &Transaction) -> (NaiveDate, String, Decimal) {
    (tx.date, normalize_description(&tx.description), tx.amount.round_dp(2))
}

/// Lowercase, punctuation to spaces, filler words dropped
pub fn normalize_description(description: &str) -> String {
    let cleaned: String = description
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c.is_whitespace() { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|w| !FILLER_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token Jaccard over normalized descriptions
pub fn description_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize_description(a), normalize_description(b));
    if a == b {
        return 1.0;
    }
    let ta: BTreeSet<&str> = a.split_whitespace().collect();
    let tb: BTreeSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / ta.union(&tb).count() as f64
}

/// 0.3·date + 0.4·amount + 0.3·description
pub fn similarity(a: &Transaction, b: &Transaction) -> f64 {
    let days = (a.date - b.date).num_days().abs() as f64;
    let date_score = (1.0 - days / 7.0).max(0.0);

    let max_amount = a.amount.abs().max(b.amount.abs());
    let amount_score = if max_amount.is_zero() {
        1.0
    } else {
        let relative = ((a.amount - b.amount).abs() / max_amount).to_f64().unwrap_or(1.0);
        (1.0 - relative).max(0.0)
    };

    0.3 * date_score + 0.4 * amount_score + 0.3 * description_similarity(&a.description, &b.description)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(day: u32, description: &str, cents: i64) -> Transaction {
        Transaction::new(NaiveDate::from_ymd_opt(2024, 10, day).unwrap(), description, Decimal::new(cents, 2))
    }

    #[test]
    fn test_total_within_absolute_tolerance() {
        let golden = vec![tx(1, "ALUGUEL", 100000)];
        let extracted = vec![tx(1, "ALUGUEL", 100004)];

        let result = GoldenValidator::new().compare(&extracted, &golden);
        assert!(result.total_amount_match);
        assert_eq!(result.amount_difference, Decimal::new(4, 2));
        assert!(result.is_valid());

        let off = vec![tx(1, "ALUGUEL", 100006)];
        assert!(!GoldenValidator::new().compare(&off, &golden).total_amount_match);

        println!("✅ Golden total matched within 0.05");
    }

    #[test]
    fn test_exact_then_fuzzy_matching() {
        let golden = vec![
            tx(5, "NETFLIX.COM", 3990),
            tx(7, "SUPERMERCADO PAO DE ACUCAR", 15230),
            tx(9, "FARMACIA", 2000),
        ];
        let extracted = vec![
            tx(5, "netflix com", 3990),
            tx(8, "SUPERMERCADO PAO ACUCAR LOJA", 15230),
            tx(20, "ALGO DIFERENTE", 777),
        ];

        let validator = GoldenValidator::new();
        let matches = validator.find_matches(&extracted, &golden);
        assert_eq!(matches, vec![(0, 0), (1, 1)]);

        let result = validator.compare(&extracted, &golden);
        assert_eq!(result.true_positives, 2);
        assert_eq!(result.false_positives, 1);
        assert_eq!(result.false_negatives, 1);
        assert!(result.transaction_count_match);
        assert!(result.mismatches.iter().any(|m| m.starts_with("Missing from extraction")));
    }

    #[test]
    fn test_empty_sets_compare_perfectly() {
        let result = GoldenValidator::new().compare(&[], &[]);
        assert_eq!(result.precision, 1.0);
        assert_eq!(result.recall, 1.0);
        assert_eq!(result.f1_score, 1.0);
        assert_eq!(result.cell_accuracy, 1.0);
    }

    #[test]
    fn test_load_reference_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("golden_itau-2024-10.csv");
        std::fs::write(
            &path,
            "post_date;desc_raw;amount_brl;category;fx_rate\n\
             2024-10-05;NETFLIX.COM;218,50;Streaming;5,4750\n\
             not-a-date;BROKEN;10,00;;\n\
             2024-10-06;BAD AMOUNT;12,3,4;;\n\
             06/10/2024;PADARIA;25,50;;\n",
        )
        .unwrap();

        let transactions = load_reference(&path).unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].fx_rate, Some(Decimal::new(54750, 4)));
        assert_eq!(transactions[0].category.as_deref(), Some("Streaming"));
        assert_eq!(transactions[1].date, NaiveDate::from_ymd_opt(2024, 10, 6).unwrap());
        assert_eq!(transactions[1].category, None);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.csv");
        std::fs::write(&path, "date,description\n2024-10-05,NETFLIX\n").unwrap();
        assert!(load_reference(&path).is_err());
        assert!(load_reference(&dir.path().join("absent.csv")).is_err());
    }

    #[test]
    fn test_library_lookup_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("golden_Itau-2024-10.csv"),
            "date,description,amount,category\n2024-10-05,NETFLIX,39.90,Streaming\n2024-10-01,MERCADO,100.10,Food\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let library = GoldenLibrary::load_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 1);
        assert!(library.lookup("Itau_2024_10.pdf").is_some());
        assert!(library.lookup("itau-2024-10").is_some());
        assert!(library.lookup("Nubank_2024-10.pdf").is_none());

        let summary = &library.summary()["itau_2024_10"];
        assert_eq!(summary.transaction_count, 2);
        assert_eq!(summary.total_amount, Decimal::new(14000, 2));
        assert_eq!(summary.categories, vec!["Food".to_string(), "Streaming".to_string()]);
        assert_eq!(
            summary.date_range,
            Some((NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(), NaiveDate::from_ymd_opt(2024, 10, 5).unwrap()))
        );
    }
}
