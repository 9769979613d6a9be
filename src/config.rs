// ⚙️ Ensemble Configuration - TOML file + environment overrides
// Resolution order: explicit path → $LEDGER_ENSEMBLE_CONFIG → compiled defaults,
// then per-field env overrides on top.

use anyhow::{Context as AnyhowContext, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::EnsembleError;

pub const CONFIG_ENV_VAR: &str = "LEDGER_ENSEMBLE_CONFIG";
pub const MODE_ENV_VAR: &str = "LEDGER_ENSEMBLE_MODE";
pub const THRESHOLD_ENV_VAR: &str = "LEDGER_ENSEMBLE_THRESHOLD";

// ============================================================================
// RUN MODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Stop at the first successful outcome at or above the threshold
    Race,
    /// Wait for every backend
    Parallel,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Parallel
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Race => write!(f, "race"),
            RunMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for RunMode {
    type Err = EnsembleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "race" => Ok(RunMode::Race),
            "parallel" => Ok(RunMode::Parallel),
            other => Err(EnsembleError::Config(format!("unknown run mode '{}'", other))),
        }
    }
}

// ============================================================================
// CLUSTERING TOLERANCES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTolerances {
    /// Max calendar-day distance between cluster members
    pub date_tolerance_days: i64,

    /// Max absolute amount difference (base currency)
    pub amount_tolerance: Decimal,

    /// Minimum token-set ratio between descriptions
    pub text_similarity_threshold: f64,
}

impl Default for ClusterTolerances {
    fn default() -> Self {
        ClusterTolerances {
            date_tolerance_days: 1,
            amount_tolerance: Decimal::new(1, 2),
            text_similarity_threshold: 0.70,
        }
    }
}

// ============================================================================
// ENSEMBLE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub mode: RunMode,

    /// Confidence an outcome must reach to win a race
    pub race_threshold: f64,

    /// Per-backend wall-clock limit
    pub backend_timeout_secs: u64,

    /// SQLite file holding trained calibrators (None = static mapping only)
    pub calibration_db: Option<PathBuf>,

    pub clustering: ClusterTolerances,

    /// Relative tolerance for statement totals
    pub statement_total_tolerance: Decimal,

    /// Absolute tolerance for golden total comparison
    pub golden_amount_tolerance: Decimal,

    /// Optional JSON rules file for the category/city classifier pass
    pub classifier_rules: Option<PathBuf>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        EnsembleConfig {
            mode: RunMode::Parallel,
            race_threshold: 0.90,
            backend_timeout_secs: 120,
            calibration_db: None,
            clustering: ClusterTolerances::default(),
            statement_total_tolerance: Decimal::new(5, 2),
            golden_amount_tolerance: Decimal::new(5, 2),
            classifier_rules: None,
        }
    }
}

impl EnsembleConfig {
    /// Resolve configuration: explicit file, then env-pointed file, then defaults.
    /// Env overrides always apply last.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::from_file(path)?
        } else if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            Self::from_file(Path::new(&path))?
        } else {
            debug!("No config file given, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded ensemble config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EnsembleConfig = toml::from_str(content)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var(MODE_ENV_VAR) {
            self.mode = mode.parse()?;
            debug!(mode = %self.mode, "Mode overridden from environment");
        }
        if let Ok(threshold) = std::env::var(THRESHOLD_ENV_VAR) {
            self.race_threshold = threshold.trim().parse().map_err(|_| {
                EnsembleError::Config(format!("invalid {}: '{}'", THRESHOLD_ENV_VAR, threshold))
            })?;
            debug!(threshold = self.race_threshold, "Race threshold overridden from environment");
        }
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), EnsembleError> {
        if !(0.0..=1.0).contains(&self.race_threshold) {
            return Err(EnsembleError::Config(format!(
                "race_threshold must be in [0, 1], got {}",
                self.race_threshold
            )));
        }
        if self.backend_timeout_secs == 0 {
            return Err(EnsembleError::Config(
                "backend_timeout_secs must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.clustering.text_similarity_threshold) {
            return Err(EnsembleError::Config(format!(
                "text_similarity_threshold must be in [0, 1], got {}",
                self.clustering.text_similarity_threshold
            )));
        }
        if self.clustering.date_tolerance_days < 0 {
            return Err(EnsembleError::Config(
                "date_tolerance_days cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================
