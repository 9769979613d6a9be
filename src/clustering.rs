// 🧩 Clustering & Conflict Resolution - one transaction per real event
// Candidates from every successful backend are grouped first-fit against each
// cluster's representative, then each cluster elects a single winner.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::calibration::{merge_confidence_scores, MergeStrategy};
use crate::config::ClusterTolerances;
use crate::model::{BackendKind, ExtractionOutcome, Transaction, STRATEGY_ALL_FAILED, STRATEGY_SINGLE};

// ============================================================================
// TEXT SIMILARITY
// ============================================================================

/// Lowercase, turn every non-alphanumeric char into a space, trim
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect::<String>()
        .trim()
        .to_string()
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Normalized indel similarity in [0, 1]: 2·LCS / (len(a) + len(b))
pub fn indel_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / total as f64
}

/// Token-set ratio in [0, 1]. Word order and repeated words are ignored;
/// one token set fully contained in the other scores 1.0.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let tokens_a: BTreeSet<&str> = a.split_whitespace().collect();
    let tokens_b: BTreeSet<&str> = b.split_whitespace().collect();

    let sect = join_tokens(tokens_a.intersection(&tokens_b));
    let diff_ab = join_tokens(tokens_a.difference(&tokens_b));
    let diff_ba = join_tokens(tokens_b.difference(&tokens_a));

    if !sect.is_empty() && (diff_ab.is_empty() || diff_ba.is_empty()) {
        return 1.0;
    }

    let sect_ab = join_parts(&sect, &diff_ab);
    let sect_ba = join_parts(&sect, &diff_ba);

    let mut best = indel_ratio(&sect_ab, &sect_ba);
    if !sect.is_empty() {
        best = best
            .max(indel_ratio(&sect, &sect_ab))
            .max(indel_ratio(&sect, &sect_ba));
    }
    best
}

fn join_tokens<'a>(tokens: impl Iterator<Item = &'a &'a str>) -> String {
    tokens.copied().collect::<Vec<_>>().join(" ")
}

fn join_parts(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{} {}", head, tail),
    }
}

// ============================================================================
// CANDIDATES & CLUSTERS
// ============================================================================

/// A transaction tagged with where it came from
#[derive(Debug, Clone)]
pub struct Candidate {
    pub transaction: Transaction,
    pub backend: BackendKind,
    /// Outcome-level (calibrated) confidence of the producing backend
    pub outcome_confidence: f64,
    /// Position in the flattened emission order
    pub order: usize,
}

impl Candidate {
    /// weighted_merge(tx confidence, outcome confidence) × backend trust weight
    pub fn combined_score(&self) -> f64 {
        let merged = merge_confidence_scores(
            &[self.transaction.confidence, self.outcome_confidence],
            MergeStrategy::WeightedAverage,
        );
        merged * self.backend.trust_weight()
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    /// First member is the representative; never reordered
    pub members: Vec<Candidate>,
}

impl Cluster {
    pub fn representative(&self) -> &Transaction {
        &self.members[0].transaction
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Highest combined score. Members sit in emission order and only a
    /// strictly higher score replaces the leader, so ties go to the earliest.
    pub fn winner(&self) -> &Candidate {
        let mut best = &self.members[0];
        let mut best_score = best.combined_score();
        for member in &self.members[1..] {
            let score = member.combined_score();
            if score > best_score {
                best = member;
                best_score = score;
            }
        }
        best
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutput {
    pub transactions: Vec<Transaction>,
    pub strategy: String,
    pub conflicts_resolved: usize,
    pub clusters: usize,
}

// ============================================================================
// CLUSTERING ENGINE
// ============================================================================

pub struct ClusteringEngine {
    pub tolerances: ClusterTolerances,
}

impl ClusteringEngine {
    /// Create engine with default tolerances (±1 day, ±0.01, ratio ≥ 0.70)
    pub fn new() -> Self {
        ClusteringEngine {
            tolerances: ClusterTolerances::default(),
        }
    }

    pub fn with_tolerances(tolerances: ClusterTolerances) -> Self {
        ClusteringEngine { tolerances }
    }

    /// All three must hold: date, amount and description similarity
    pub fn is_same_event(&self, a: &Transaction, b: &Transaction) -> bool {
        if days_between(a.date, b.date) > self.tolerances.date_tolerance_days {
            return false;
        }
        if (a.amount - b.amount).abs() > self.tolerances.amount_tolerance {
            return false;
        }
        token_set_ratio(&a.description, &b.description) >= self.tolerances.text_similarity_threshold
    }

    /// Flatten successful outcomes in outcome order, then transaction order
    pub fn candidates(outcomes: &[ExtractionOutcome]) -> Vec<Candidate> {
        outcomes
            .iter()
            .filter(|o| o.success())
            .flat_map(|o| {
                o.transactions.iter().map(move |tx| (tx, o.backend, o.confidence))
            })
            .enumerate()
            .map(|(order, (tx, backend, outcome_confidence))| Candidate {
                transaction: tx.clone(),
                backend,
                outcome_confidence,
                order,
            })
            .collect()
    }

    /// Greedy first-fit. No re-balancing once a candidate is placed.
    pub fn cluster(&self, candidates: Vec<Candidate>) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();

        for candidate in candidates {
            let slot = clusters
                .iter()
                .position(|c| self.is_same_event(c.representative(), &candidate.transaction));
            match slot {
                Some(index) => clusters[index].members.push(candidate),
                None => clusters.push(Cluster {
                    members: vec![candidate],
                }),
            }
        }

        clusters
    }

    /// Pick the cluster's winner. Multi-member winners become ensemble-produced.
    pub fn resolve(&self, cluster: &Cluster) -> Transaction {
        if cluster.len() == 1 {
            return cluster.members[0].transaction.clone();
        }

        let winner = cluster.winner();
        debug!(
            winner = %winner.backend,
            members = cluster.len(),
            score = winner.combined_score(),
            "Cluster conflict resolved"
        );

        let mut tx = winner.transaction.clone();
        tx.source_backend = None;
        tx.raw_text = Some(format!("Ensemble: {}", tx.raw_text.as_deref().unwrap_or_default()));
        tx
    }

    /// Merge the outcomes into one transaction list
    pub fn merge(&self, outcomes: &[ExtractionOutcome]) -> MergeOutput {
        let successful: Vec<&ExtractionOutcome> = outcomes.iter().filter(|o| o.success()).collect();

        match successful.len() {
            0 => {
                return MergeOutput {
                    transactions: Vec::new(),
                    strategy: STRATEGY_ALL_FAILED.to_string(),
                    conflicts_resolved: 0,
                    clusters: 0,
                }
            }
            1 => {
                let only = successful[0];
                return MergeOutput {
                    transactions: only.transactions.clone(),
                    strategy: STRATEGY_SINGLE.to_string(),
                    conflicts_resolved: 0,
                    clusters: only.transactions.len(),
                };
            }
            _ => {}
        }

        let clusters = self.cluster(Self::candidates(outcomes));
        let conflicts_resolved: usize = clusters.iter().map(|c| c.len() - 1).sum();
        let transactions: Vec<Transaction> = clusters.iter().map(|c| self.resolve(c)).collect();

        info!(
            pipelines = successful.len(),
            clusters = clusters.len(),
            conflicts = conflicts_resolved,
            "Outcomes merged"
        );

        MergeOutput {
            transactions,
            strategy: format!("ensemble_merge_{}_pipelines", successful.len()),
            conflicts_resolved,
            clusters: clusters.len(),
        }
    }
}

impl Default for ClusteringEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

/// Sum of amounts, as reported on EnsembleResult
pub fn sum_amounts(transactions: &[Transaction]) -> Decimal {
    transactions.iter().map(|t| t.amount).sum()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
    }

    fn tx(day: u32, description: &str, cents: i64, confidence: f64) -> Transaction {
        Transaction::new(d(day), description, Decimal::new(cents, 2)).with_confidence(confidence)
    }

    fn outcome(kind: BackendKind, confidence: f64, transactions: Vec<Transaction>) -> ExtractionOutcome {
        let transactions = transactions.into_iter().map(|t| t.with_source(kind)).collect();
        ExtractionOutcome::new(kind, transactions, confidence)
    }

    #[test]
    fn test_token_set_ratio() {
        assert_eq!(token_set_ratio("NETFLIX.COM", "netflix com"), 1.0);
        assert_eq!(token_set_ratio("UBER TRIP", "UBER"), 1.0);
        assert_eq!(token_set_ratio("", "UBER"), 0.0);

        let netflix = token_set_ratio("NETFLIX.COM", "NETFLIX *STREAMING");
        assert!((netflix - 14.0 / 18.0).abs() < 1e-9, "got {}", netflix);

        assert!(token_set_ratio("PADARIA REAL", "POSTO SHELL") < 0.5);
    }

    #[test]
    fn test_indel_ratio() {
        assert_eq!(indel_ratio("", ""), 1.0);
        assert_eq!(indel_ratio("abc", "abc"), 1.0);
        assert_eq!(indel_ratio("abc", "xyz"), 0.0);
        assert!((indel_ratio("abcd", "abxd") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_netflix_scenario() {
        let a = outcome(BackendKind::PdfText, 0.80, vec![tx(5, "NETFLIX.COM", 3990, 0.70)]);
        let b = outcome(BackendKind::Textract, 0.95, vec![tx(5, "NETFLIX *STREAMING", 3990, 0.92)]);

        let merged = ClusteringEngine::new().merge(&[a, b]);

        assert_eq!(merged.transactions.len(), 1);
        assert_eq!(merged.conflicts_resolved, 1);
        assert_eq!(merged.strategy, "ensemble_merge_2_pipelines");
        assert_eq!(merged.transactions[0].description, "NETFLIX *STREAMING");
        assert_eq!(merged.transactions[0].source_backend, None);

        println!("✅ NETFLIX cluster resolved to backend B");
    }

    #[test]
    fn test_single_pipeline_identity() {
        let only = outcome(
            BackendKind::PdfTable,
            0.8,
            vec![tx(5, "NETFLIX.COM", 3990, 0.7), tx(5, "NETFLIX.COM", 3990, 0.7)],
        );
        let failed = ExtractionOutcome::failed(BackendKind::Textract, "boom");

        let merged = ClusteringEngine::new().merge(&[only.clone(), failed]);

        assert_eq!(merged.strategy, "single_pipeline");
        assert_eq!(merged.conflicts_resolved, 0);
        assert_eq!(merged.transactions, only.transactions);
    }

    #[test]
    fn test_no_successful_outcomes() {
        let merged = ClusteringEngine::new().merge(&[ExtractionOutcome::failed(BackendKind::Textract, "x")]);
        assert_eq!(merged.strategy, STRATEGY_ALL_FAILED);
        assert!(merged.transactions.is_empty());
    }

    #[test]
    fn test_conflicts_equal_sum_of_cluster_sizes_minus_one() {
        let a = outcome(
            BackendKind::PdfText,
            0.9,
            vec![tx(1, "UBER TRIP", 2500, 0.9), tx(2, "IFOOD", 4500, 0.9), tx(3, "AMAZON", 9900, 0.9)],
        );
        let b = outcome(
            BackendKind::PdfTable,
            0.85,
            vec![tx(1, "UBER TRIP SAO PAULO", 2500, 0.8), tx(2, "IFOOD *RESTAURANTE", 4500, 0.8)],
        );
        let c = outcome(BackendKind::Textract, 0.95, vec![tx(2, "IFOOD", 4501, 0.95), tx(9, "SPOTIFY", 1990, 0.9)]);

        let engine = ClusteringEngine::new();
        let outcomes = [a, b, c];
        let clusters = engine.cluster(ClusteringEngine::candidates(&outcomes));
        let expected: usize = clusters.iter().map(|c| c.len() - 1).sum();

        let merged = engine.merge(&outcomes);
        assert_eq!(merged.conflicts_resolved, expected);
        assert_eq!(merged.conflicts_resolved, 3);
        assert_eq!(merged.transactions.len(), 4);
        assert_eq!(sum_amounts(&merged.transactions), merged.transactions.iter().map(|t| t.amount).sum());
    }

    #[test]
    fn test_tie_goes_to_earliest_emission() {
        let a = outcome(BackendKind::PdfText, 0.9, vec![tx(5, "PADARIA REAL", 1000, 0.9)]);
        let b = outcome(BackendKind::GoogleDocAi, 0.9, vec![tx(5, "PADARIA REAL LTDA", 1000, 0.9)]);

        let merged = ClusteringEngine::new().merge(&[a, b]);
        assert_eq!(merged.transactions.len(), 1);
        assert_eq!(merged.transactions[0].description, "PADARIA REAL");
    }

    #[test]
    fn test_first_fit_against_representative() {
        let engine = ClusteringEngine::new();
        // Day 2 joins day 1's cluster; day 3 is 2 days from the representative
        let a = outcome(BackendKind::PdfText, 0.9, vec![tx(1, "ACME", 1000, 0.9)]);
        let b = outcome(BackendKind::PdfTable, 0.9, vec![tx(2, "ACME", 1000, 0.9)]);
        let c = outcome(BackendKind::Textract, 0.9, vec![tx(3, "ACME", 1000, 0.9)]);

        let clusters = engine.cluster(ClusteringEngine::candidates(&[a, b, c]));
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
        assert_eq!(clusters[1].len(), 1);
    }

    #[test]
    fn test_amount_tolerance_boundary() {
        let engine = ClusteringEngine::new();
        assert!(engine.is_same_event(&tx(5, "ACME", 1000, 1.0), &tx(5, "ACME", 1001, 1.0)));
        assert!(!engine.is_same_event(&tx(5, "ACME", 1000, 1.0), &tx(5, "ACME", 1002, 1.0)));
        assert!(engine.is_same_event(&tx(5, "ACME", 1000, 1.0), &tx(6, "ACME", 1000, 1.0)));
        assert!(!engine.is_same_event(&tx(5, "ACME", 1000, 1.0), &tx(7, "ACME", 1000, 1.0)));
    }
}
