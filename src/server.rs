//! HTTP backend for the search UI.
//!
//! The UI submits one search job, polls its status and pulls results as
//! they are published. At most one job exists at a time; see [`crate::job`]
//! for the supersede policy.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/entropy_search` | Start a search job (202 with the job id) |
//! | `GET`  | `/get/status` | Job status, progress and phase message |
//! | `GET`  | `/get/all_spectra` | One summary row per query spectrum |
//! | `GET`  | `/get/one_spectrum/{scan}` | Query spectrum with its ranked hits per mode |
//! | `GET`  | `/get/one_library_spectrum/{charge}/{idx}` | A library spectrum |
//! | `GET`  | `/get/cpu` | Available parallelism, for the core picker |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/exit` | Cancel the active job and shut the server down |
//!
//! # Error Contract
//!
//! Errors are always JSON bodies, never dropped connections:
//!
//! ```json
//! { "status": "Error: not found: scan 42", "is_error": true }
//! ```
//!
//! Status codes: 400 (invalid request or unreadable input), 404 (unknown scan
//! or library reference), 409 (busy, or results not loaded yet), 500.
//! Malformed JSON bodies and path segments use the same body with 400.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the UI is served from a
//! different origin than the backend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use entropy_search_core::models::{parse_charge, LibraryRef, MetaValue, Peak, SearchMode, Spectrum};
use entropy_search_core::search::QueryOutcome;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{validate_ranking, validate_tolerances, Config};
use crate::error::SearchError;
use crate::formats::LoadOptions;
use crate::job::{JobManager, JobStatus, StatusSnapshot};
use crate::orchestrator::{LibraryHit, SearchContext, SearchRequest};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    jobs: JobManager,
    /// Signalled by `/exit`.
    shutdown: Arc<Notify>,
}

/// Starts the HTTP backend on `[server].bind` and serves until `/exit`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Entropy search backend listening on http://{}", bind_addr);
    serve(listener, config).await
}

/// Serve on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, config: &Config) -> anyhow::Result<()> {
    let state = AppState {
        config: Arc::new(config.clone()),
        jobs: JobManager::new(config.server.reject_when_busy),
        shutdown: Arc::new(Notify::new()),
    };
    let shutdown = Arc::clone(&state.shutdown);
    let jobs = state.jobs.clone();

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    jobs.cancel_active("server shutting down");
    info!("server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/entropy_search", post(handle_search))
        .route("/get/status", get(handle_status))
        .route("/get/all_spectra", get(handle_all_spectra))
        .route("/get/one_spectrum/{scan}", get(handle_one_spectrum))
        .route(
            "/get/one_library_spectrum/{charge}/{idx}",
            get(handle_one_library_spectrum),
        )
        .route("/get/cpu", get(handle_cpu))
        .route("/health", get(handle_health))
        .route("/exit", get(handle_exit))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    status: String,
    is_error: bool,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: format!("Error: {}", self.message),
            is_error: true,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        let status = match &err {
            SearchError::Parse { .. } | SearchError::Io { .. } => StatusCode::BAD_REQUEST,
            SearchError::NotFound(_) => StatusCode::NOT_FOUND,
            SearchError::Busy | SearchError::NotReady(_) => StatusCode::CONFLICT,
            SearchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

/// The loaded inputs of the current job, or why there are none.
fn current_context(state: &AppState) -> Result<Arc<SearchContext>, SearchError> {
    state.jobs.read(|job| match job {
        None => Err(SearchError::NotReady("no search has been started".to_string())),
        Some(job) => match (&job.context, job.status) {
            (Some(context), _) => Ok(Arc::clone(context)),
            (None, JobStatus::Error) => Err(SearchError::NotReady(
                job.error_message
                    .clone()
                    .unwrap_or_else(|| "search failed".to_string()),
            )),
            (None, _) => Err(SearchError::NotReady(
                "spectra are still loading".to_string(),
            )),
        },
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /entropy_search ============

/// Charge as sent by the UI: a number or a string such as `"2+"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChargeField {
    Number(i32),
    Text(String),
}

impl ChargeField {
    fn resolve(&self) -> Result<i32, AppError> {
        match self {
            ChargeField::Number(n) => Ok(*n),
            ChargeField::Text(t) if t.trim().is_empty() => Ok(0),
            ChargeField::Text(t) => {
                parse_charge(t).ok_or_else(|| bad_request(format!("invalid charge: {}", t)))
            }
        }
    }
}

/// Body of `POST /entropy_search`. Missing fields fall back to `[search]`.
#[derive(Deserialize)]
struct SearchBody {
    file_query: String,
    file_library: String,
    #[serde(default)]
    charge: Option<ChargeField>,
    ms1_tolerance_in_da: Option<f64>,
    ms2_tolerance_in_da: Option<f64>,
    top_n: Option<usize>,
    score_min: Option<f64>,
    cores: Option<usize>,
}

#[derive(Serialize)]
struct SearchAccepted {
    job_id: String,
    file_query: String,
}

async fn handle_search(
    State(state): State<AppState>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> Result<(StatusCode, Json<SearchAccepted>), AppError> {
    let Json(body) = body?;
    if body.file_query.trim().is_empty() || body.file_library.trim().is_empty() {
        return Err(bad_request("file_query and file_library must not be empty"));
    }

    let defaults = &state.config.search;
    let ms1 = body.ms1_tolerance_in_da.unwrap_or(defaults.ms1_tolerance_in_da);
    let ms2 = body.ms2_tolerance_in_da.unwrap_or(defaults.ms2_tolerance_in_da);
    let top_n = body.top_n.unwrap_or(defaults.top_n);
    let score_min = body.score_min.unwrap_or(defaults.score_min);
    let cores = body.cores.unwrap_or(defaults.cores);

    validate_tolerances(ms1, ms2).map_err(|e| bad_request(e.to_string()))?;
    validate_ranking(top_n, score_min).map_err(|e| bad_request(e.to_string()))?;
    if cores == 0 {
        return Err(bad_request("cores must be >= 1"));
    }
    let charge = match &body.charge {
        Some(field) => field.resolve()?,
        None => 0,
    };

    let request = SearchRequest {
        charge,
        cores,
        load: LoadOptions {
            skip_invalid: state.config.preprocess.skip_invalid_records,
        },
        cache_library: state.config.preprocess.cache_library,
        ..SearchRequest::new(
            PathBuf::from(&body.file_query),
            PathBuf::from(&body.file_library),
            state.config.search_params(ms1, ms2, top_n, score_min),
        )
    };
    let handle = state.jobs.start(request)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SearchAccepted {
            job_id: handle.id().to_string(),
            file_query: body.file_query,
        }),
    ))
}

// ============ GET /get/status ============

async fn handle_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.jobs.status())
}

// ============ GET /get/all_spectra ============

/// One row of the query table.
#[derive(Serialize)]
struct SpectrumSummary {
    scan: u32,
    id: String,
    name: Option<String>,
    precursor_mz: f64,
    charge: i32,
    rt: Option<f64>,
    adduct: Option<String>,
    #[serde(rename = "identity_search-score")]
    identity_score: Option<f64>,
    #[serde(rename = "open_search-score")]
    open_score: Option<f64>,
    #[serde(rename = "neutral_loss_search-score")]
    neutral_loss_score: Option<f64>,
    #[serde(rename = "hybrid_search-score")]
    hybrid_score: Option<f64>,
    #[serde(rename = "identity_search-name")]
    identity_name: Option<String>,
    #[serde(rename = "identity_search-precursor_type")]
    identity_precursor_type: Option<String>,
    searched: bool,
    skipped: bool,
    failed: bool,
}

fn summarize(
    context: &SearchContext,
    spectrum: &Spectrum,
    outcome: Option<&QueryOutcome>,
    failed: bool,
) -> SpectrumSummary {
    let score = |mode: SearchMode| outcome.map(|o| o.best_score(mode));
    let best = outcome
        .and_then(|o| o.best_identity())
        .and_then(|hit| context.library.get(hit.library_ref));

    SpectrumSummary {
        scan: spectrum.scan(),
        id: spectrum.id().to_string(),
        name: spectrum.name().map(str::to_string),
        precursor_mz: spectrum.precursor_mz(),
        charge: match outcome {
            Some(o) if o.skipped.is_none() => o.charge,
            _ => spectrum.charge(),
        },
        rt: spectrum.retention_time(),
        adduct: spectrum.precursor_type().map(str::to_string),
        identity_score: score(SearchMode::IdentitySearch),
        open_score: score(SearchMode::OpenSearch),
        neutral_loss_score: score(SearchMode::NeutralLossSearch),
        hybrid_score: score(SearchMode::HybridSearch),
        identity_name: best.and_then(|e| e.spectrum.name()).map(str::to_string),
        identity_precursor_type: best
            .and_then(|e| e.spectrum.precursor_type())
            .map(str::to_string),
        searched: outcome.is_some(),
        skipped: outcome.map(|o| o.skipped.is_some()).unwrap_or(false),
        failed,
    }
}

async fn handle_all_spectra(
    State(state): State<AppState>,
) -> Result<Json<Vec<SpectrumSummary>>, AppError> {
    let context = current_context(&state)?;
    let (results, failures) = state
        .jobs
        .read(|job| job.map(|j| (j.results.clone(), j.failures.clone())))
        .unwrap_or_default();

    let rows = context
        .queries
        .spectra
        .iter()
        .filter(|s| !s.peaks().is_empty())
        .map(|s| {
            let scan = s.scan();
            summarize(
                &context,
                s,
                results.get(&scan).map(Arc::as_ref),
                failures.contains_key(&scan),
            )
        })
        .collect();
    Ok(Json(rows))
}

// ============ GET /get/one_spectrum/{scan} ============

#[derive(Serialize)]
struct SpectrumDetail {
    scan: u32,
    id: String,
    name: Option<String>,
    precursor_mz: f64,
    charge: i32,
    rt: Option<f64>,
    adduct: Option<String>,
    peaks: Vec<[f64; 2]>,
    metadata: BTreeMap<String, MetaValue>,
    searched: bool,
    skipped: Option<String>,
    /// Why the query could not be scored.
    error: Option<String>,
    #[serde(flatten)]
    hits: BTreeMap<&'static str, Vec<LibraryHit>>,
}

fn peak_pairs(peaks: &[Peak]) -> Vec<[f64; 2]> {
    peaks.iter().map(|p| [p.mz, p.intensity]).collect()
}

async fn handle_one_spectrum(
    State(state): State<AppState>,
    scan: Result<Path<u32>, PathRejection>,
) -> Result<Json<SpectrumDetail>, AppError> {
    let Path(scan) = scan?;
    let context = current_context(&state)?;
    let spectrum = context
        .queries
        .get(scan)
        .ok_or_else(|| SearchError::NotFound(format!("scan {}", scan)))?
        .clone();

    let (published, failure, active) = state.jobs.read(|job| match job {
        Some(j) => (
            j.results.get(&scan).cloned(),
            j.failures.get(&scan).cloned(),
            !j.status.is_terminal(),
        ),
        None => (None, None, false),
    });
    let searched = published.is_some();

    // Queries not reached yet by a running job are searched on demand.
    let outcome = match published {
        Some(outcome) => Some(outcome),
        None if active && failure.is_none() => {
            let ctx = Arc::clone(&context);
            let query = spectrum.clone();
            let result = tokio::task::spawn_blocking(move || ctx.search(&query))
                .await
                .map_err(|e| SearchError::Internal(e.to_string()))?;
            match result {
                Ok(outcome) => Some(Arc::new(outcome)),
                Err(e) => {
                    warn!(scan, "on-demand search failed: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let hits = context.library_hits(outcome.as_deref());

    Ok(Json(SpectrumDetail {
        scan,
        id: spectrum.id().to_string(),
        name: spectrum.name().map(str::to_string),
        precursor_mz: spectrum.precursor_mz(),
        charge: match outcome.as_deref() {
            Some(o) if o.skipped.is_none() => o.charge,
            _ => spectrum.charge(),
        },
        rt: spectrum.retention_time(),
        adduct: spectrum.precursor_type().map(str::to_string),
        peaks: peak_pairs(spectrum.peaks()),
        metadata: spectrum.metadata().clone(),
        searched,
        skipped: outcome
            .as_deref()
            .and_then(|o| o.skipped)
            .map(|r| r.describe().to_string()),
        error: failure,
        hits,
    }))
}

// ============ GET /get/one_library_spectrum/{charge}/{idx} ============

#[derive(Serialize)]
struct LibrarySpectrumDetail {
    charge: i32,
    idx: usize,
    id: String,
    name: Option<String>,
    precursor_mz: f64,
    precursor_type: Option<String>,
    smiles: Option<String>,
    rt: Option<f64>,
    peaks: Vec<[f64; 2]>,
    metadata: BTreeMap<String, MetaValue>,
}

async fn handle_one_library_spectrum(
    State(state): State<AppState>,
    reference: Result<Path<(i32, usize)>, PathRejection>,
) -> Result<Json<LibrarySpectrumDetail>, AppError> {
    let Path((charge, idx)) = reference?;
    let context = current_context(&state)?;
    let library_ref = LibraryRef { charge, idx };
    let entry = context
        .library
        .get(library_ref)
        .ok_or_else(|| SearchError::NotFound(format!("library spectrum {}/{}", charge, idx)))?;
    let s = &entry.spectrum;

    Ok(Json(LibrarySpectrumDetail {
        charge,
        idx,
        id: s.id().to_string(),
        name: s.name().map(str::to_string),
        precursor_mz: s.precursor_mz(),
        precursor_type: s.precursor_type().map(str::to_string),
        smiles: s.smiles().map(str::to_string),
        rt: s.retention_time(),
        peaks: peak_pairs(s.peaks()),
        metadata: s.metadata().clone(),
    }))
}

// ============ GET /get/cpu ============

#[derive(Serialize)]
struct CpuResponse {
    cpu: usize,
}

async fn handle_cpu() -> Json<CpuResponse> {
    let cpu = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Json(CpuResponse { cpu })
}

// ============ GET /exit ============

async fn handle_exit(State(state): State<AppState>) -> Json<serde_json::Value> {
    info!("exit requested");
    state.jobs.cancel_active("server shutting down");
    state.shutdown.notify_one();
    Json(serde_json::json!({ "status": "Exiting" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_field_accepts_numbers_and_strings() {
        assert_eq!(ChargeField::Number(-1).resolve().ok(), Some(-1));
        assert_eq!(ChargeField::Text("2+".to_string()).resolve().ok(), Some(2));
        assert_eq!(ChargeField::Text(" ".to_string()).resolve().ok(), Some(0));
        assert!(ChargeField::Text("abc".to_string()).resolve().is_err());
    }

    #[test]
    fn search_errors_map_to_status_codes() {
        let cases = [
            (SearchError::NotFound("scan 1".to_string()), StatusCode::NOT_FOUND),
            (SearchError::Busy, StatusCode::CONFLICT),
            (SearchError::NotReady("x".to_string()), StatusCode::CONFLICT),
            (
                SearchError::parse(std::path::Path::new("a.msp"), "bad"),
                StatusCode::BAD_REQUEST,
            ),
            (SearchError::Internal("x".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn error_body_is_flagged() {
        let body = serde_json::to_value(ErrorBody {
            status: "Error: not found: scan 3".to_string(),
            is_error: true,
        })
        .unwrap();
        assert_eq!(body["is_error"], true);
        assert_eq!(body["status"], "Error: not found: scan 3");
    }
}
