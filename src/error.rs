// 🚨 Error Taxonomy
// Typed failures for the ensemble engine. Backend failures never show up here:
// they are recorded on ExtractionOutcome.error instead.

use thiserror::Error;

/// Result alias for library operations that have a typed failure mode
pub type LedgerResult<T> = std::result::Result<T, EnsembleError>;

#[derive(Error, Debug)]
pub enum EnsembleError {
    /// Amount field has digits but cannot be parsed (fatal for the record)
    #[error("Unparsable amount '{raw}': {reason}")]
    AmountParse { raw: String, reason: String },

    /// Not enough paired samples to fit a calibration regressor
    #[error("Insufficient calibration data for {backend}: need >= {required}, got {samples}")]
    InsufficientData {
        backend: String,
        samples: usize,
        required: usize,
    },

    /// Paired inputs of different lengths
    #[error("Length mismatch: {left} raw scores vs {right} ground-truth values")]
    LengthMismatch { left: usize, right: usize },

    /// Golden reference could not be read at all
    #[error("Reference error: {0}")]
    Reference(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Calibration store error (wraps rusqlite::Error)
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialized model could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error (wraps csv::Error)
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl EnsembleError {
    pub fn amount_parse(raw: &str, reason: impl Into<String>) -> Self {
        EnsembleError::AmountParse {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the non-fatal "not enough samples" condition
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, EnsembleError::InsufficientData { .. })
    }
}
