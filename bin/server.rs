// Ledger Ensemble - Reporting Server
// JSON API over the merge engine and the accuracy analyzer (axum)

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use ledger_ensemble::{
    csv_backends, telemetry, BackendKind, CellAccuracyAnalyzer, EnsembleConfig, EnsembleMerger, ExtractionOutcome,
    GoldenValidator, StatementText, Transaction, VERSION,
};

/// Default bind address when LEDGER_SERVER_ADDR is unset
const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Shared application state
#[derive(Clone)]
struct AppState {
    merger: Arc<EnsembleMerger>,
    validator: Arc<GoldenValidator>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    mode: String,
    backends: BTreeMap<String, bool>,
}

#[derive(Deserialize)]
struct CompareRequest {
    extracted: Vec<Transaction>,
    golden: Vec<Transaction>,
    #[serde(default)]
    extractor_name: Option<String>,
}

#[derive(Deserialize)]
struct MergeRequest {
    outcomes: Vec<ExtractionOutcome>,
    #[serde(default)]
    statement_text: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check plus backend availability
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let backends = csv_backends(&BackendKind::ALL);
    Json(ApiResponse::ok(HealthResponse {
        status: "OK",
        version: VERSION,
        mode: state.merger.config().mode.to_string(),
        backends: state.merger.health_check(&backends),
    }))
}

/// POST /api/analyze - Cell accuracy health report
async fn analyze(Json(request): Json<CompareRequest>) -> impl IntoResponse {
    let name = request.extractor_name.as_deref().unwrap_or("api");
    let report = CellAccuracyAnalyzer::new().analyze_named(&request.extracted, &request.golden, name, "");
    (StatusCode::OK, Json(ApiResponse::ok(report)))
}

/// POST /api/validate - Semantic comparison against a golden list
async fn validate(State(state): State<AppState>, Json(request): Json<CompareRequest>) -> impl IntoResponse {
    let result = state.validator.compare(&request.extracted, &request.golden);
    (StatusCode::OK, Json(ApiResponse::ok(result)))
}

/// POST /api/merge - Merge outcomes collected elsewhere
async fn merge(State(state): State<AppState>, Json(request): Json<MergeRequest>) -> impl IntoResponse {
    let merger = Arc::clone(&state.merger);
    let joined = tokio::task::spawn_blocking(move || {
        let statement = request.statement_text.map(StatementText::new);
        merger.merge_outcomes(request.outcomes, statement.as_ref())
    })
    .await;

    match joined {
        Ok(result) => (StatusCode::OK, Json(ApiResponse::ok(result))).into_response(),
        Err(e) => {
            error!(error = %e, "Merge task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiResponse::<()>::err(e.to_string()))).into_response()
        }
    }
}

/// GET /api/calibration - Trained regressors per backend
async fn calibration(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(state.merger.calibrator().calibration_stats()))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(false)?;

    let config = EnsembleConfig::load(None)?;
    let merger = EnsembleMerger::from_config(config.clone())?;

    let state = AppState {
        merger: Arc::new(merger),
        validator: Arc::new(GoldenValidator::from_config(&config)),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/analyze", post(analyze))
        .route("/validate", post(validate))
        .route("/merge", post(merge))
        .route("/calibration", get(calibration))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(CorsLayer::permissive());

    let addr = std::env::var("LEDGER_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, mode = %config.mode, "Server running");

    axum::serve(listener, app).await?;
    Ok(())
}
