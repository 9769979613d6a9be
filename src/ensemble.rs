// 🎯 Ensemble Merger - orchestrate → merge → aggregate → enrich
// The end-to-end entry point used by the CLI and the server.

use anyhow::{Context as AnyhowContext, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregate::aggregate_confidence;
use crate::backend::ExtractorBackend;
use crate::calibration::ConfidenceCalibrator;
use crate::clustering::ClusteringEngine;
use crate::config::EnsembleConfig;
use crate::enrichment::{EnrichmentPipeline, StatementText};
use crate::model::{EnsembleResult, ExtractionOutcome};
use crate::orchestrator::{successful_backends, Orchestrator};

pub struct EnsembleMerger {
    config: EnsembleConfig,
    calibrator: Arc<ConfidenceCalibrator>,
    orchestrator: Orchestrator,
    clustering: ClusteringEngine,
    pipeline: EnrichmentPipeline,
}

impl EnsembleMerger {
    pub fn new(config: EnsembleConfig, calibrator: Arc<ConfidenceCalibrator>) -> Self {
        EnsembleMerger {
            orchestrator: Orchestrator::from_config(Arc::clone(&calibrator), &config),
            clustering: ClusteringEngine::with_tolerances(config.clustering.clone()),
            pipeline: EnrichmentPipeline::from_config(&config),
            calibrator,
            config,
        }
    }

    /// Build from config, opening the calibration store when one is configured
    pub fn from_config(config: EnsembleConfig) -> Result<Self> {
        let calibrator = match &config.calibration_db {
            Some(path) => ConfidenceCalibrator::open(path)
                .with_context(|| format!("Failed to open calibration store: {}", path.display()))?,
            None => ConfidenceCalibrator::new(),
        };
        Ok(Self::new(config, Arc::new(calibrator)))
    }

    pub fn with_pipeline(mut self, pipeline: EnrichmentPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn calibrator(&self) -> &Arc<ConfidenceCalibrator> {
        &self.calibrator
    }

    /// Run every backend against the document and merge what comes back
    pub async fn extract(
        &self,
        document: &Path,
        backends: &[Arc<dyn ExtractorBackend>],
        statement: Option<&StatementText>,
    ) -> EnsembleResult {
        let outcomes = self
            .orchestrator
            .run(document, backends, self.config.mode, self.config.race_threshold)
            .await;
        self.merge_outcomes(outcomes, statement)
    }

    /// Merge already-collected outcomes (confidences assumed calibrated)
    pub fn merge_outcomes(&self, outcomes: Vec<ExtractionOutcome>, statement: Option<&StatementText>) -> EnsembleResult {
        let contributing = successful_backends(&outcomes);
        if contributing.is_empty() {
            warn!(outcomes = outcomes.len(), "All backends failed");
            return EnsembleResult::all_failed(outcomes);
        }

        let merged = self.clustering.merge(&outcomes);
        let confidence = aggregate_confidence(&outcomes, &merged.transactions);

        let mut result = EnsembleResult {
            run_id: uuid::Uuid::new_v4().to_string(),
            final_transactions: merged.transactions,
            contributing_backends: contributing,
            confidence,
            outcomes,
            merge_strategy: merged.strategy,
            conflicts_resolved: merged.conflicts_resolved,
            validation_flags: BTreeMap::new(),
            statement: None,
        };

        self.pipeline.enrich(&mut result, statement);

        info!(
            run_id = %result.run_id,
            strategy = %result.merge_strategy,
            transactions = result.final_transactions.len(),
            conflicts = result.conflicts_resolved,
            confidence = result.confidence,
            total = %result.total_amount(),
            "Ensemble complete"
        );
        result
    }

    /// Availability per backend id
    pub fn health_check(&self, backends: &[Arc<dyn ExtractorBackend>]) -> BTreeMap<String, bool> {
        backends
            .iter()
            .map(|b| (b.kind().id().to_string(), b.is_available()))
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
