// 🏥 Cell Accuracy Analyzer - field-by-field scoring against a golden reference
//
// Alignment: golden rows keyed by (date, amount at 2 dp), consumed first-fit.
// Every tracked field of every aligned pair is compared with a comparator
// picked from a fixed table. Critical fields weigh 2, the rest 1.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

use crate::model::Transaction;

/// Error examples kept per field
const MAX_ERROR_EXAMPLES: usize = 5;
/// Fields named in a poor-grade recommendation
const WORST_FIELDS_REPORTED: usize = 3;

// ============================================================================
// FIELDS & COMPARATORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Date,
    Amount,
    Description,
    Category,
    CurrencyOrig,
    MerchantCity,
    FxRate,
    CardLast4,
}

impl TrackedField {
    /// Report order
    pub const ALL: [TrackedField; 8] = [
        TrackedField::Date,
        TrackedField::Amount,
        TrackedField::Description,
        TrackedField::Category,
        TrackedField::CurrencyOrig,
        TrackedField::MerchantCity,
        TrackedField::FxRate,
        TrackedField::CardLast4,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TrackedField::Date => "date",
            TrackedField::Amount => "amount",
            TrackedField::Description => "description",
            TrackedField::Category => "category",
            TrackedField::CurrencyOrig => "currency_orig",
            TrackedField::MerchantCity => "merchant_city",
            TrackedField::FxRate => "fx_rate",
            TrackedField::CardLast4 => "card_last4",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            TrackedField::Date | TrackedField::Amount | TrackedField::Description | TrackedField::Category
        )
    }

    pub fn weight(&self) -> f64 {
        if self.is_critical() {
            2.0
        } else {
            1.0
        }
    }

    pub fn comparator(&self) -> Comparator {
        match self {
            TrackedField::Date => Comparator::Date,
            TrackedField::Amount | TrackedField::FxRate => Comparator::Amount,
            TrackedField::Description => Comparator::Description,
            TrackedField::Category => Comparator::Category,
            TrackedField::CurrencyOrig | TrackedField::CardLast4 => Comparator::Exact,
            TrackedField::MerchantCity => Comparator::Fuzzy,
        }
    }

    pub fn value(&self, tx: &Transaction) -> Cell {
        let text = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        match self {
            TrackedField::Date => Cell::Date(tx.date),
            TrackedField::Amount => Cell::Number(Some(tx.amount)),
            TrackedField::FxRate => Cell::Number(tx.fx_rate),
            TrackedField::Description => Cell::Text(Some(tx.description.clone())),
            TrackedField::Category => Cell::Text(text(&tx.category)),
            TrackedField::CurrencyOrig => Cell::Text(text(&tx.currency_orig)),
            TrackedField::MerchantCity => Cell::Text(text(&tx.merchant_city)),
            TrackedField::CardLast4 => Cell::Text(text(&tx.card_last4)),
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One compared cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Date(NaiveDate),
    Number(Option<Decimal>),
    Text(Option<String>),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Cell::Number(Some(n)) => write!(f, "{}", n),
            Cell::Text(Some(t)) => write!(f, "{}", t),
            Cell::Number(None) | Cell::Text(None) => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Date,
    /// Absolute difference under 0.01
    Amount,
    /// Case-insensitive equality, or containment when both exceed 10 chars
    Description,
    /// Case-insensitive equality
    Category,
    Exact,
    /// Case-insensitive equality, or containment when both exceed 5 chars
    Fuzzy,
}

impl Comparator {
    pub fn matches(&self, extracted: &Cell, golden: &Cell) -> bool {
        match (self, extracted, golden) {
            (Comparator::Date, Cell::Date(a), Cell::Date(b)) => a == b,
            (Comparator::Amount, Cell::Number(Some(a)), Cell::Number(Some(b))) => {
                (*a - *b).abs() < Decimal::new(1, 2)
            }
            (_, Cell::Number(a), Cell::Number(b)) => a.is_none() && b.is_none(),
            (_, Cell::Text(Some(a)), Cell::Text(Some(b))) => self.text_matches(a, b),
            (_, Cell::Text(a), Cell::Text(b)) => a.is_none() && b.is_none(),
            _ => false,
        }
    }

    fn text_matches(&self, a: &str, b: &str) -> bool {
        let (a, b) = (a.trim().to_uppercase(), b.trim().to_uppercase());
        let contained = |min: usize| a.chars().count() > min && b.chars().count() > min && (a.contains(&b) || b.contains(&a));
        match self {
            Comparator::Exact => a == b,
            Comparator::Category => a == b,
            Comparator::Description => a == b || contained(10),
            Comparator::Fuzzy => a == b || contained(5),
            Comparator::Date | Comparator::Amount => false,
        }
    }
}

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub field: TrackedField,
    pub total_cells: usize,
    pub correct_cells: usize,
    pub incorrect_cells: usize,
    pub missing_cells: usize,
    pub extra_cells: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub error_examples: Vec<String>,
}

/// Letter grades, worst first so that `Ord` follows quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthGrade {
    F,
    D,
    C,
    #[serde(rename = "C+")]
    CPlus,
    B,
    #[serde(rename = "B+")]
    BPlus,
    A,
    #[serde(rename = "A+")]
    APlus,
}

impl HealthGrade {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.90 => HealthGrade::APlus,
            s if s >= 0.85 => HealthGrade::A,
            s if s >= 0.80 => HealthGrade::BPlus,
            s if s >= 0.70 => HealthGrade::B,
            s if s >= 0.60 => HealthGrade::CPlus,
            s if s >= 0.50 => HealthGrade::C,
            s if s >= 0.40 => HealthGrade::D,
            _ => HealthGrade::F,
        }
    }

    /// 0.4·overall + 0.6·critical
    pub fn weighted_score(overall: f64, critical: f64) -> f64 {
        0.4 * overall + 0.6 * critical
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthGrade::APlus => "A+",
            HealthGrade::A => "A",
            HealthGrade::BPlus => "B+",
            HealthGrade::B => "B",
            HealthGrade::CPlus => "C+",
            HealthGrade::C => "C",
            HealthGrade::D => "D",
            HealthGrade::F => "F",
        }
    }
}

impl fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub extractor_name: String,
    pub document: String,
    pub overall_accuracy: f64,
    pub critical_fields_accuracy: f64,
    pub transaction_precision: f64,
    pub transaction_recall: f64,
    pub transaction_f1: f64,
    pub field_accuracies: Vec<FieldAccuracy>,
    /// Extracted rows with no golden counterpart
    pub extra_transactions: usize,
    /// Golden rows never matched
    pub missing_transactions: usize,
    pub health_grade: HealthGrade,
    pub recommended_action: String,
}

impl HealthReport {
    pub fn field(&self, field: TrackedField) -> Option<&FieldAccuracy> {
        self.field_accuracies.iter().find(|f| f.field == field)
    }

    pub fn summary(&self) -> String {
        format!(
            "Grade {}: overall {:.1}%, critical {:.1}%, F1 {:.1}% ({} missing, {} extra)",
            self.health_grade,
            self.overall_accuracy * 100.0,
            self.critical_fields_accuracy * 100.0,
            self.transaction_f1 * 100.0,
            self.missing_transactions,
            self.extra_transactions
        )
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// (extracted, golden); at least one side is present
type AlignedPair<'a> = (Option<&'a Transaction>, Option<&'a Transaction>);

pub struct CellAccuracyAnalyzer {
    fields: Vec<TrackedField>,
}

impl CellAccuracyAnalyzer {
    pub fn new() -> Self {
        CellAccuracyAnalyzer {
            fields: TrackedField::ALL.to_vec(),
        }
    }

    pub fn analyze(&self, extracted: &[Transaction], golden: &[Transaction]) -> HealthReport {
        self.analyze_named(extracted, golden, "ensemble", "")
    }

    pub fn analyze_named(
        &self,
        extracted: &[Transaction],
        golden: &[Transaction],
        extractor_name: &str,
        document: &str,
    ) -> HealthReport {
        let aligned = align(extracted, golden);
        let extra_transactions = aligned.iter().filter(|(_, g)| g.is_none()).count();
        let missing_transactions = aligned.iter().filter(|(e, _)| e.is_none()).count();

        let field_accuracies: Vec<FieldAccuracy> =
            self.fields.iter().map(|f| field_accuracy(&aligned, *f)).collect();

        let overall_accuracy = overall_accuracy(&field_accuracies);
        let critical_fields_accuracy = critical_accuracy(&field_accuracies);
        let (transaction_precision, transaction_recall, transaction_f1) =
            transaction_metrics(extracted, golden);

        let health_grade =
            HealthGrade::from_score(HealthGrade::weighted_score(overall_accuracy, critical_fields_accuracy));
        let recommended_action = recommendation(health_grade, &field_accuracies);

        info!(
            extractor = extractor_name,
            extracted = extracted.len(),
            golden = golden.len(),
            overall = overall_accuracy,
            critical = critical_fields_accuracy,
            grade = %health_grade,
            "Cell accuracy analyzed"
        );

        HealthReport {
            extractor_name: extractor_name.to_string(),
            document: document.to_string(),
            overall_accuracy,
            critical_fields_accuracy,
            transaction_precision,
            transaction_recall,
            transaction_f1,
            field_accuracies,
            extra_transactions,
            missing_transactions,
            health_grade,
            recommended_action,
        }
    }
}

impl Default for CellAccuracyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Pair extracted rows with golden rows on (date, amount at 2 dp), first-fit
/// without reuse. Unmatched rows of either side become one-sided pairs.
pub fn align<'a>(extracted: &'a [Transaction], golden: &'a [Transaction]) -> Vec<AlignedPair<'a>> {
    let mut by_key: HashMap<(NaiveDate, Decimal), Vec<usize>> = HashMap::new();
    for (i, tx) in golden.iter().enumerate() {
        by_key.entry(tx.alignment_key()).or_default().push(i);
    }

    let mut used = vec![false; golden.len()];
    let mut pairs = Vec::with_capacity(extracted.len() + golden.len());

    for tx in extracted {
        let slot = by_key
            .get(&tx.alignment_key())
            .and_then(|candidates| candidates.iter().copied().find(|i| !used[*i]));
        match slot {
            Some(i) => {
                used[i] = true;
                pairs.push((Some(tx), Some(&golden[i])));
            }
            None => pairs.push((Some(tx), None)),
        }
    }

    pairs.extend(
        golden
            .iter()
            .zip(used.iter())
            .filter(|(_, used)| !**used)
            .map(|(g, _)| (None, Some(g))),
    );

    debug!(pairs = pairs.len(), "Transactions aligned");
    pairs
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

pub fn field_accuracy(aligned: &[AlignedPair<'_>], field: TrackedField) -> FieldAccuracy {
    let comparator = field.comparator();
    let (mut total, mut correct, mut incorrect, mut missing, mut extra) = (0, 0, 0, 0, 0);
    let mut error_examples = Vec::new();

    for pair in aligned {
        match pair {
            (Some(ext), Some(gold)) => {
                total += 1;
                let (got, expected) = (field.value(ext), field.value(gold));
                if comparator.matches(&got, &expected) {
                    correct += 1;
                } else {
                    incorrect += 1;
                    if error_examples.len() < MAX_ERROR_EXAMPLES {
                        error_examples.push(format!("Expected: {}, Got: {}", expected, got));
                    }
                }
            }
            (None, Some(gold)) => {
                total += 1;
                missing += 1;
                if error_examples.len() < MAX_ERROR_EXAMPLES {
                    error_examples.push(format!("Missing: {}", field.value(gold)));
                }
            }
            (Some(_), None) => extra += 1,
            (None, None) => {}
        }
    }

    let precision = ratio(correct, correct + incorrect + extra);
    let recall = ratio(correct, correct + missing);

    FieldAccuracy {
        field,
        total_cells: total,
        correct_cells: correct,
        incorrect_cells: incorrect,
        missing_cells: missing,
        extra_cells: extra,
        accuracy: ratio(correct, total),
        precision,
        recall,
        f1_score: f1(precision, recall),
        error_examples,
    }
}

/// Weighted mean of field accuracies (critical fields weigh 2)
pub fn overall_accuracy(fields: &[FieldAccuracy]) -> f64 {
    let total_weight: f64 = fields.iter().map(|f| f.field.weight()).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    fields.iter().map(|f| f.accuracy * f.field.weight()).sum::<f64>() / total_weight
}

pub fn critical_accuracy(fields: &[FieldAccuracy]) -> f64 {
    let critical: Vec<f64> = fields.iter().filter(|f| f.field.is_critical()).map(|f| f.accuracy).collect();
    if critical.is_empty() {
        0.0
    } else {
        critical.iter().sum::<f64>() / critical.len() as f64
    }
}

/// Precision, recall, F1 over the distinct (date, amount) keys of each side
pub fn transaction_metrics(extracted: &[Transaction], golden: &[Transaction]) -> (f64, f64, f64) {
    let extracted_keys: HashSet<_> = extracted.iter().map(Transaction::alignment_key).collect();
    let golden_keys: HashSet<_> = golden.iter().map(Transaction::alignment_key).collect();

    let tp = extracted_keys.intersection(&golden_keys).count();
    let fp = extracted_keys.len() - tp;
    let fn_ = golden_keys.len() - tp;

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    (precision, recall, f1(precision, recall))
}

pub fn recommendation(grade: HealthGrade, fields: &[FieldAccuracy]) -> String {
    let worst = || {
        let mut sorted: Vec<&FieldAccuracy> = fields.iter().collect();
        sorted.sort_by(|a, b| a.accuracy.total_cmp(&b.accuracy));
        sorted
            .iter()
            .take(WORST_FIELDS_REPORTED)
            .map(|f| format!("{} ({:.1}%)", f.field, f.accuracy * 100.0))
            .collect::<Vec<_>>()
            .join(", ")
    };

    match grade {
        HealthGrade::APlus | HealthGrade::A => "Excellent performance. Use as primary extractor.".to_string(),
        HealthGrade::BPlus | HealthGrade::B => {
            "Good performance. Suitable for production with light review.".to_string()
        }
        HealthGrade::CPlus => "Fair performance. Use with careful review or as secondary method.".to_string(),
        HealthGrade::C => format!(
            "Fair performance. Use with careful review or as secondary method. Weakest fields: {}.",
            worst()
        ),
        HealthGrade::D | HealthGrade::F => format!(
            "Poor performance. Major issues with: {}. Consider alternative methods.",
            worst()
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================
