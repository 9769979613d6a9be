// 📊 Ensemble Aggregator - one confidence for the merged result

use crate::model::{ExtractionOutcome, Transaction};

/// Weight of the mean successful-outcome confidence
const OUTCOME_WEIGHT: f64 = 0.5;
/// Weight of the mean merged-transaction confidence
const TRANSACTION_WEIGHT: f64 = 0.4;
/// Weight of the agreement bonus
const AGREEMENT_WEIGHT: f64 = 0.1;

/// 0.5·mean(outcome conf) + 0.4·mean(tx conf) + 0.1·min(0.3, 0.1·n_success), capped at 1.0.
/// Zero successful outcomes or zero merged transactions gives 0.0.
pub fn aggregate_confidence(outcomes: &[ExtractionOutcome], merged: &[Transaction]) -> f64 {
    let successful: Vec<f64> = outcomes.iter().filter(|o| o.success()).map(|o| o.confidence).collect();
    if successful.is_empty() || merged.is_empty() {
        return 0.0;
    }

    let outcome_mean = successful.iter().sum::<f64>() / successful.len() as f64;
    let transaction_mean = merged.iter().map(|t| t.confidence).sum::<f64>() / merged.len() as f64;
    let agreement = (0.1 * successful.len() as f64).min(0.3);

    (OUTCOME_WEIGHT * outcome_mean + TRANSACTION_WEIGHT * transaction_mean + AGREEMENT_WEIGHT * agreement).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendKind;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn tx(confidence: f64) -> Transaction {
        Transaction::new(NaiveDate::from_ymd_opt(2024, 10, 5).unwrap(), "X", Decimal::ONE)
            .with_confidence(confidence)
    }

    #[test]
    fn test_aggregate_formula() {
        let outcomes = vec![
            ExtractionOutcome::new(BackendKind::Textract, vec![tx(0.9)], 0.9),
            ExtractionOutcome::new(BackendKind::PdfText, vec![tx(0.9)], 0.7),
            ExtractionOutcome::failed(BackendKind::PdfTable, "boom"),
        ];
        let merged = vec![tx(0.8), tx(0.6)];

        // 0.5·0.8 + 0.4·0.7 + 0.1·0.2
        let expected = 0.4 + 0.28 + 0.02;
        assert!((aggregate_confidence(&outcomes, &merged) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_agreement_bonus_caps_at_three_backends() {
        let outcomes: Vec<_> = BackendKind::ALL
            .iter()
            .map(|k| ExtractionOutcome::new(*k, vec![tx(1.0)], 1.0))
            .collect();
        let score = aggregate_confidence(&outcomes, &[tx(1.0)]);
        assert!((score - 0.93).abs() < 1e-9);
    }

    #[test]
    fn test_empty_inputs_yield_zero() {
        let ok = vec![ExtractionOutcome::new(BackendKind::Textract, vec![tx(0.9)], 0.9)];
        assert_eq!(aggregate_confidence(&ok, &[]), 0.0);
        assert_eq!(aggregate_confidence(&[ExtractionOutcome::failed(BackendKind::Textract, "x")], &[tx(1.0)]), 0.0);
    }
}
