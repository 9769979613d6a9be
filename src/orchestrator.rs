// 🏁 Orchestrator - concurrent backend execution
// Parallel: every backend runs to completion (or timeout).
// Race: first successful outcome at/above the threshold cancels the rest.

use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ExtractorBackend;
use crate::calibration::ConfidenceCalibrator;
use crate::config::{EnsembleConfig, RunMode};
use crate::model::{BackendKind, ExtractionOutcome};

pub struct Orchestrator {
    calibrator: Arc<ConfidenceCalibrator>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(calibrator: Arc<ConfidenceCalibrator>, timeout: Duration) -> Self {
        Orchestrator { calibrator, timeout }
    }

    pub fn from_config(calibrator: Arc<ConfidenceCalibrator>, config: &EnsembleConfig) -> Self {
        Self::new(calibrator, config.backend_timeout())
    }

    /// Run all backends concurrently and collect their outcomes.
    ///
    /// Never fails: unavailable backends, errors, panics and timeouts come back
    /// as failed outcomes. In race mode only the outcomes seen before the
    /// winner are returned (winner included).
    pub async fn run(
        &self,
        document: &Path,
        backends: &[Arc<dyn ExtractorBackend>],
        mode: RunMode,
        threshold: f64,
    ) -> Vec<ExtractionOutcome> {
        let run_token = CancellationToken::new();
        // Dropping this future mid-run cancels every spawned backend
        let _guard = run_token.clone().drop_guard();
        let mut pending = FuturesUnordered::new();
        let mut outcomes = Vec::with_capacity(backends.len());

        for backend in backends {
            if !backend.is_available() {
                warn!(backend = %backend.kind(), "Backend unavailable, recorded as failed");
                outcomes.push(ExtractionOutcome::failed(backend.kind(), "Backend unavailable"));
                continue;
            }
            let kind = backend.kind();
            let handle = tokio::spawn(run_backend(
                Arc::clone(backend),
                document.to_path_buf(),
                Arc::clone(&self.calibrator),
                self.timeout,
                run_token.child_token(),
            ));
            pending.push(async move { (kind, handle.await) });
        }

        info!(
            backends = pending.len(),
            unavailable = outcomes.len(),
            mode = %mode,
            threshold,
            "Starting extraction"
        );

        while let Some((kind, joined)) = pending.next().await {
            let outcome = match joined {
                Ok(Some(outcome)) => outcome,
                // Cancelled before finishing: nothing to record
                Ok(None) => continue,
                Err(e) => {
                    warn!(backend = %kind, error = %e, "Backend task panicked");
                    ExtractionOutcome::failed(kind, format!("Extractor task failed: {}", e))
                }
            };

            let winner = mode == RunMode::Race && outcome.success() && outcome.confidence >= threshold;
            if winner {
                info!(
                    backend = %kind,
                    confidence = outcome.confidence,
                    cancelled = pending.len(),
                    "Early termination, cancelling remaining backends"
                );
            }
            outcomes.push(outcome);

            if winner {
                run_token.cancel();
                break;
            }
        }

        outcomes
    }
}

/// One backend task. Returns None only when cancelled before completion.
async fn run_backend(
    backend: Arc<dyn ExtractorBackend>,
    document: PathBuf,
    calibrator: Arc<ConfidenceCalibrator>,
    limit: Duration,
    cancel: CancellationToken,
) -> Option<ExtractionOutcome> {
    let kind = backend.kind();
    let started = Instant::now();
    debug!(backend = %kind, version = backend.version(), "Backend started");

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(backend = %kind, "Backend cancelled, result discarded");
            return None;
        }
        result = tokio::time::timeout(limit, backend.extract(&document)) => result,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let outcome = match result {
        Ok(Ok(mut outcome)) => {
            let raw = outcome.confidence;
            outcome.backend = kind;
            outcome.confidence = calibrator.calibrate(kind, raw);
            if outcome.duration_ms == 0 {
                outcome.duration_ms = elapsed_ms;
            }
            debug!(
                backend = %kind,
                transactions = outcome.transactions.len(),
                raw_confidence = raw,
                confidence = outcome.confidence,
                duration_ms = outcome.duration_ms,
                "Backend finished"
            );
            outcome
        }
        Ok(Err(e)) => {
            let message = format!("{:#}", e);
            warn!(backend = %kind, error = %message, "Backend failed");
            ExtractionOutcome::failed(kind, format!("Extractor error: {}", message)).with_duration_ms(elapsed_ms)
        }
        Err(_) => {
            warn!(backend = %kind, timeout_secs = limit.as_secs_f64(), "Backend timed out");
            ExtractionOutcome::failed(kind, format!("Extractor timed out after {:?}", limit))
                .with_duration_ms(elapsed_ms)
        }
    };

    Some(outcome)
}

/// Kinds of the successful outcomes, in outcome order
pub fn successful_backends(outcomes: &[ExtractionOutcome]) -> Vec<BackendKind> {
    outcomes.iter().filter(|o| o.success()).map(|o| o.backend).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockBehavior};
    use crate::model::Transaction;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;

    fn sample_tx() -> Transaction {
        Transaction::new(
            NaiveDate::from_ymd_opt(2024, 10, 5).unwrap(),
            "NETFLIX.COM",
            Decimal::new(3990, 2),
        )
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(ConfidenceCalibrator::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_race_returns_first_winner_and_cancels_rest() {
        let a = MockBackend::new(BackendKind::Textract, 10, 0.95, vec![sample_tx()]);
        let b = MockBackend::new(BackendKind::AzureDocIntelligence, 500, 0.99, vec![sample_tx()]);
        let c = MockBackend::new(BackendKind::GoogleDocAi, 800, 0.99, vec![sample_tx()]);
        let (b_done, c_done) = (b.finished_flag(), c.finished_flag());

        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![Arc::new(a), Arc::new(b), Arc::new(c)];
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &backends, RunMode::Race, 0.90)
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].backend, BackendKind::Textract);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!b_done.load(Ordering::SeqCst));
        assert!(!c_done.load(Ordering::SeqCst));

        println!("✅ Race mode cancelled slower backends");
    }

    #[tokio::test]
    async fn test_race_keeps_going_below_threshold() {
        // PdfText raw 0.95 calibrates to 0.855 (< 0.90), so the race continues
        let a = MockBackend::new(BackendKind::PdfText, 10, 0.95, vec![sample_tx()]);
        let b = MockBackend::new(BackendKind::Textract, 50, 0.93, vec![sample_tx()]);

        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![Arc::new(a), Arc::new(b)];
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &backends, RunMode::Race, 0.90)
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].backend, BackendKind::PdfText);
        assert!((outcomes[0].confidence - 0.855).abs() < 1e-9);
        assert_eq!(outcomes[1].backend, BackendKind::Textract);
    }

    #[tokio::test]
    async fn test_parallel_isolates_failures() {
        let ok = MockBackend::new(BackendKind::Textract, 10, 0.9, vec![sample_tx()]);
        let failing = MockBackend::new(BackendKind::PdfTable, 5, 0.9, vec![]).with_behavior(MockBehavior::Fail);
        let panicking =
            MockBackend::new(BackendKind::GoogleDocAi, 5, 0.9, vec![]).with_behavior(MockBehavior::Panic);

        let backends: Vec<Arc<dyn ExtractorBackend>> =
            vec![Arc::new(ok), Arc::new(failing), Arc::new(panicking)];
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &backends, RunMode::Parallel, 0.90)
            .await;

        assert_eq!(outcomes.len(), 3);
        let failed: Vec<_> = outcomes.iter().filter(|o| o.error.is_some()).collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|o| o.transactions.is_empty() && o.confidence == 0.0));
        assert_eq!(successful_backends(&outcomes), vec![BackendKind::Textract]);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_outcome() {
        let hanging =
            MockBackend::new(BackendKind::AzureDocIntelligence, 0, 0.9, vec![]).with_behavior(MockBehavior::Hang);
        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![Arc::new(hanging)];

        let orchestrator = Orchestrator::new(Arc::new(ConfidenceCalibrator::new()), Duration::from_millis(50));
        let outcomes = orchestrator
            .run(Path::new("doc.pdf"), &backends, RunMode::Parallel, 0.90)
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].error.as_deref().unwrap_or("").contains("timed out"));
        assert!(!outcomes[0].success());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_recorded_as_failed() {
        let offline = MockBackend::new(BackendKind::Textract, 0, 0.9, vec![sample_tx()]).with_available(false);
        let online = MockBackend::new(BackendKind::PdfText, 10, 0.9, vec![sample_tx()]);
        let offline_done = offline.finished_flag();

        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![Arc::new(offline), Arc::new(online)];
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &backends, RunMode::Parallel, 0.90)
            .await;

        assert_eq!(outcomes.len(), 2);
        let offline = outcomes.iter().find(|o| o.backend == BackendKind::Textract).unwrap();
        assert!(!offline.success());
        assert!(offline.error.as_deref().unwrap_or("").contains("unavailable"));
        assert!(!offline_done.load(Ordering::SeqCst));
        assert_eq!(successful_backends(&outcomes), vec![BackendKind::PdfText]);

        println!("✅ Unavailable backend kept as a failed outcome");
    }

    #[tokio::test]
    async fn test_all_unavailable_still_reports_every_backend() {
        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![
            Arc::new(MockBackend::new(BackendKind::Textract, 0, 0.9, vec![]).with_available(false)),
            Arc::new(MockBackend::new(BackendKind::GoogleDocAi, 0, 0.9, vec![]).with_available(false)),
        ];
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &backends, RunMode::Race, 0.90)
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success()));
    }

    #[tokio::test]
    async fn test_dropping_run_cancels_backends() {
        let slow = MockBackend::new(BackendKind::AzureDocIntelligence, 300, 0.95, vec![sample_tx()]);
        let slow_done = slow.finished_flag();
        let backends: Vec<Arc<dyn ExtractorBackend>> = vec![Arc::new(slow)];

        let orchestrator = orchestrator();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.run(Path::new("doc.pdf"), &backends, RunMode::Parallel, 0.90),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!slow_done.load(Ordering::SeqCst));

        println!("✅ Abandoned run cancelled its backends");
    }

    #[tokio::test]
    async fn test_no_backends_returns_empty() {
        let outcomes = orchestrator()
            .run(Path::new("doc.pdf"), &[], RunMode::Parallel, 0.90)
            .await;
        assert!(outcomes.is_empty());
    }
}
