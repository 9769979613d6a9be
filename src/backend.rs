// 🔌 Extractor Backends - capability trait + CSV export backend
// Each backend turns a statement document into an ExtractionOutcome.
// Errors returned here are caught by the orchestrator and recorded on the outcome.

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chrono::Datelike;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::calibration::{extraction_confidence, transaction_confidence};
use crate::model::{normalize_date, parse_amount, BackendKind, ExtractionOutcome, Transaction};

// ============================================================================
// BACKEND CAPABILITY
// ============================================================================

/// ExtractorBackend - one extraction engine
///
/// Implementations may block on I/O or remote APIs; the orchestrator runs each
/// one as its own task and never lets an `Err` or panic escape.
#[async_trait]
pub trait ExtractorBackend: Send + Sync {
    /// Which engine this is (drives calibration and trust weight)
    fn kind(&self) -> BackendKind;

    /// Backend version (for provenance tracking)
    fn version(&self) -> &str {
        "1.0"
    }

    /// Whether dependencies/credentials are in place
    fn is_available(&self) -> bool {
        true
    }

    /// Extract transactions from the document.
    ///
    /// The returned confidence is RAW; calibration happens in the orchestrator.
    async fn extract(&self, document: &Path) -> Result<ExtractionOutcome>;
}

// ============================================================================
// CSV EXPORT BACKEND
// ============================================================================

/// Reads rows pre-extracted by an external engine.
///
/// Format: `date;description;amount[;category]` with a header row. For a
/// document `fatura.pdf` the export is looked up as `fatura.<backend-id>.csv`
/// next to it unless an explicit path is configured; a `.csv` document is read
/// directly.
#[derive(Debug, Clone)]
pub struct CsvExportBackend {
    kind: BackendKind,
    export_path: Option<PathBuf>,
    ocr_confidence: f64,
    default_year: i32,
}

impl CsvExportBackend {
    pub fn new(kind: BackendKind) -> Self {
        CsvExportBackend {
            kind,
            export_path: None,
            ocr_confidence: 1.0,
            default_year: chrono::Local::now().year(),
        }
    }

    /// Builder pattern: read this file regardless of the document path
    pub fn with_export_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.export_path = Some(path.into());
        self
    }

    /// Builder pattern: provider-reported OCR confidence (cloud kinds)
    pub fn with_ocr_confidence(mut self, confidence: f64) -> Self {
        self.ocr_confidence = confidence;
        self
    }

    /// Builder pattern: year for day/month-only dates
    pub fn with_default_year(mut self, year: i32) -> Self {
        self.default_year = year;
        self
    }

    pub fn export_path_for(&self, document: &Path) -> PathBuf {
        if let Some(path) = &self.export_path {
            return path.clone();
        }
        if document.extension().and_then(|e| e.to_str()) == Some("csv") {
            return document.to_path_buf();
        }
        let stem = document
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("statement");
        document.with_file_name(format!("{}.{}.csv", stem, self.kind.id()))
    }

    /// Parse the export synchronously. Rows with unreadable dates are skipped;
    /// an unparsable amount fails the whole export.
    pub fn read_export(&self, path: &Path) -> Result<(Vec<Transaction>, usize)> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("Failed to open export: {}", path.display()))?;

        let mut transactions = Vec::new();
        let mut rows = 0;

        for (line_num, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("Failed to read line {} in {}", line_num + 2, path.display())
            })?;
            rows += 1;

            let raw_date = record.get(0).unwrap_or("");
            let description = record.get(1).unwrap_or("").to_string();
            let raw_amount = record.get(2).unwrap_or("");

            let date = match normalize_date(raw_date, self.default_year) {
                Some(date) => date,
                None => {
                    debug!(line = line_num + 2, date = raw_date, "Skipping row with bad date");
                    continue;
                }
            };

            let amount = parse_amount(raw_amount)
                .with_context(|| format!("Line {} in {}", line_num + 2, path.display()))?;

            let has_amount = raw_amount.chars().any(|c| c.is_ascii_digit());
            let description_quality = if description.trim().len() >= 3 { 1.0 } else { 0.5 };
            let confidence = transaction_confidence(
                true,
                has_amount,
                description_quality,
                true,
                self.ocr_confidence,
            );

            let mut tx = Transaction::new(date, description, amount)
                .with_confidence(confidence)
                .with_source(self.kind);
            tx.raw_text = Some(record.iter().collect::<Vec<_>>().join(";"));

            if let Some(category) = record.get(3).filter(|c| !c.is_empty()) {
                tx = tx.with_category(category);
            }

            transactions.push(tx);
        }

        Ok((transactions, rows))
    }
}

#[async_trait]
impl ExtractorBackend for CsvExportBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    /// A pinned export must exist; per-document exports are resolved at extract time
    fn is_available(&self) -> bool {
        self.export_path.as_ref().map_or(true, |path| path.is_file())
    }

    async fn extract(&self, document: &Path) -> Result<ExtractionOutcome> {
        let started = Instant::now();
        let path = self.export_path_for(document);

        let this = self.clone();
        let (transactions, rows) = tokio::task::spawn_blocking(move || this.read_export(&path))
            .await
            .context("CSV export reader task failed")??;

        if transactions.len() < rows {
            warn!(
                backend = %self.kind,
                skipped = rows - transactions.len(),
                "Export rows skipped"
            );
        }

        let confidence = extraction_confidence(
            self.kind,
            transactions.len(),
            rows,
            transactions.len(),
            self.ocr_confidence,
        );

        Ok(ExtractionOutcome::new(self.kind, transactions, confidence)
            .with_duration_ms(started.elapsed().as_millis() as u64)
            .with_page_count(1))
    }
}

/// Build CSV export backends for the given kinds
pub fn csv_backends(kinds: &[BackendKind]) -> Vec<Arc<dyn ExtractorBackend>> {
    kinds
        .iter()
        .map(|kind| Arc::new(CsvExportBackend::new(*kind)) as Arc<dyn ExtractorBackend>)
        .collect()
}

// ============================================================================
// TEST BACKENDS
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================
