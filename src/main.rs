// Ledger Ensemble - CLI
//
//   ledger-ensemble extract <document> [--statement <file>] [--backends a,b] [--scanned] [--config <file>]
//   ledger-ensemble analyze <extracted.csv> <golden.csv>
//   ledger-ensemble validate <extracted.csv> <golden.csv | golden-dir>
//   ledger-ensemble golden-summary <golden-dir>
//   ledger-ensemble train-calibration <backend-id> <samples.csv> [--config <file>]
//
// Every command prints JSON on stdout; logs go to stderr.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing::info;

use ledger_ensemble::{
    csv_backends, load_reference, telemetry, BackendKind, CellAccuracyAnalyzer, ConfidenceCalibrator,
    EnsembleConfig, EnsembleMerger, GoldenLibrary, GoldenValidator, StatementText,
};

const USAGE: &str = "usage: ledger-ensemble <extract|analyze|validate|golden-summary|train-calibration> ...";

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(true)?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };
    let rest = &args[1..];

    match command.as_str() {
        "extract" => run_extract(rest).await,
        "analyze" => run_analyze(rest),
        "validate" => run_validate(rest),
        "golden-summary" => run_golden_summary(rest),
        "train-calibration" => run_train_calibration(rest),
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Value following `--name`, if present
fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Positional arguments (flags and their values removed)
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--scanned" => {}
            a if a.starts_with("--") => {
                iter.next();
            }
            a => out.push(a),
        }
    }
    out
}

fn load_config(args: &[String]) -> Result<EnsembleConfig> {
    EnsembleConfig::load(flag_value(args, "--config").map(Path::new))
}

async fn run_extract(args: &[String]) -> Result<()> {
    let positional = positional(args);
    let Some(&document) = positional.first() else {
        bail!("extract needs a document path");
    };
    let config = load_config(args)?;

    let kinds = match flag_value(args, "--backends") {
        Some(list) => list
            .split(',')
            .map(|id| BackendKind::from_id(id.trim()).with_context(|| format!("unknown backend '{}'", id)))
            .collect::<Result<Vec<_>>>()?,
        None => BackendKind::auto_select(args.iter().any(|a| a == "--scanned")),
    };

    let statement = match flag_value(args, "--statement") {
        Some(path) => Some(StatementText::new(
            std::fs::read_to_string(path).with_context(|| format!("Failed to read statement text: {}", path))?,
        )),
        None => None,
    };

    let merger = EnsembleMerger::from_config(config)?;
    let backends = csv_backends(&kinds);
    info!(document, backends = kinds.len(), "Extracting");

    let result = merger.extract(Path::new(document), &backends, statement.as_ref()).await;
    print_json(&result)
}

fn run_analyze(args: &[String]) -> Result<()> {
    let [extracted, golden] = positional(args)[..] else {
        bail!("analyze needs <extracted.csv> <golden.csv>");
    };

    let extracted_txs = load_reference(Path::new(extracted))?;
    let golden_txs = load_reference(Path::new(golden))?;

    let report = CellAccuracyAnalyzer::new().analyze_named(&extracted_txs, &golden_txs, extracted, golden);
    info!(grade = %report.health_grade, "{}", report.summary());
    print_json(&report)
}

#[derive(Serialize)]
struct ValidateOutput<'a> {
    document: &'a str,
    /// None when no golden reference exists for the document
    validation: Option<ledger_ensemble::ValidationResult>,
    is_valid: bool,
}

fn run_validate(args: &[String]) -> Result<()> {
    let [extracted, golden] = positional(args)[..] else {
        bail!("validate needs <extracted.csv> <golden.csv | golden-dir>");
    };
    let config = load_config(args)?;
    let validator = GoldenValidator::from_config(&config);
    let extracted_txs = load_reference(Path::new(extracted))?;

    let golden_path = Path::new(golden);
    let validation = if golden_path.is_dir() {
        let library = GoldenLibrary::load_dir(golden_path)?;
        let document = Path::new(extracted)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(extracted);
        library.validate(document, &extracted_txs, &validator)
    } else {
        Some(validator.compare(&extracted_txs, &load_reference(golden_path)?))
    };

    if validation.is_none() {
        info!(document = extracted, "No golden reference, no comparison possible");
    }

    let is_valid = validation.as_ref().map_or(false, |v| v.is_valid());
    print_json(&ValidateOutput {
        document: extracted,
        validation,
        is_valid,
    })
}

fn run_golden_summary(args: &[String]) -> Result<()> {
    let [dir] = positional(args)[..] else {
        bail!("golden-summary needs <golden-dir>");
    };
    let library = GoldenLibrary::load_dir(Path::new(dir))?;
    print_json(&library.summary())
}

/// Samples file: `raw_score,accuracy` per line, optional header
fn run_train_calibration(args: &[String]) -> Result<()> {
    let [backend_id, samples] = positional(args)[..] else {
        bail!("train-calibration needs <backend-id> <samples.csv>");
    };
    let kind = BackendKind::from_id(backend_id).with_context(|| format!("unknown backend '{}'", backend_id))?;
    let config = load_config(args)?;
    let Some(db) = config.calibration_db.as_deref() else {
        bail!("calibration_db is not configured");
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(samples)
        .with_context(|| format!("Failed to open samples: {}", samples))?;

    let (mut raw, mut truth) = (Vec::new(), Vec::new());
    for record in reader.records() {
        let record = record?;
        let (Some(Ok(r)), Some(Ok(t))) = (
            record.get(0).map(str::parse::<f64>),
            record.get(1).map(str::parse::<f64>),
        ) else {
            continue;
        };
        raw.push(r);
        truth.push(t);
    }

    let calibrator = ConfidenceCalibrator::open(db)?;
    calibrator.train(kind, &raw, &truth)?;
    print_json(&calibrator.calibration_stats())
}
