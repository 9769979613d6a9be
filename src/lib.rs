// Ledger Ensemble - Core Library
// Merges several extraction backends into one trusted transaction list and
// scores extractions against golden references.

pub mod error;
pub mod model;
pub mod config;
pub mod telemetry;
pub mod calibration;   // Confidence calibration + SQLite persistence
pub mod backend;       // Extractor capability + CSV export backend
pub mod orchestrator;  // Race / parallel execution
pub mod clustering;    // Fuzzy clustering + conflict resolution
pub mod aggregate;
pub mod enrichment;    // Post-merge passes
pub mod ensemble;
pub mod accuracy;      // Cell Accuracy Analyzer
pub mod golden;

// Re-export commonly used types
pub use error::{EnsembleError, LedgerResult};
pub use model::{
    BackendKind, EnsembleResult, ExtractionOutcome, StatementMetadata, Transaction, TransactionType,
    ValidationResult, parse_amount, normalize_date,
};
pub use config::{ClusterTolerances, EnsembleConfig, RunMode};
pub use calibration::{ConfidenceCalibrator, ConfidenceThresholds, IsotonicRegressor, MergeStrategy};
pub use backend::{CsvExportBackend, ExtractorBackend, csv_backends};
pub use orchestrator::Orchestrator;
pub use clustering::{ClusteringEngine, MergeOutput};
pub use aggregate::aggregate_confidence;
pub use enrichment::{EnrichmentPipeline, EnrichmentReport, StatementText};
pub use ensemble::EnsembleMerger;
pub use accuracy::{CellAccuracyAnalyzer, FieldAccuracy, HealthGrade, HealthReport, TrackedField};
pub use golden::{GoldenLibrary, GoldenSummary, GoldenValidator, load_reference};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
