//! Axum HTTP surface for the trips runner.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use trips_core::RunRequest;
use trips_pipeline::{
    spawn_detached, PipelineRunner, Settings, Stage, BOUNDING_BOX_REPORT_KEY, REGION_REPORT_KEY,
};

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<PipelineRunner>,
}

impl AppState {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
struct RegionQuery {
    region: String,
}

#[derive(Debug, Deserialize)]
struct BoundingBoxQuery {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
}

impl BoundingBoxQuery {
    fn into_params(self) -> BTreeMap<String, JsonValue> {
        BTreeMap::from([
            ("min_lon".to_string(), JsonValue::from(self.min_lon)),
            ("min_lat".to_string(), JsonValue::from(self.min_lat)),
            ("max_lon".to_string(), JsonValue::from(self.max_lon)),
            ("max_lat".to_string(), JsonValue::from(self.max_lat)),
        ])
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/init_db/", post(init_db_handler))
        .route("/ingest/", post(ingest_handler))
        .route("/transform/", post(transform_handler))
        .route("/run_all/", post(run_all_handler))
        .route("/weekly_average_region", get(weekly_average_region_handler))
        .route("/weekly_average_bounding_box/", get(weekly_average_bounding_box_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let runner = PipelineRunner::from_settings(settings)?;
    let state = AppState::new(Arc::new(runner));
    let listener = TcpListener::bind(("0.0.0.0", settings.web_port)).await?;
    info!(port = settings.web_port, "trips API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn root_handler() -> Json<JsonValue> {
    Json(json!({"message": "Welcome to trips ETL API"}))
}

async fn init_db_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.runner.init_db().await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(json!({"status": "Database tables created"})),
        )
            .into_response(),
        Err(err) => not_found(err),
    }
}

async fn ingest_handler(State(state): State<Arc<AppState>>, Json(request): Json<RunRequest>) -> Response {
    start_stage(&state, Stage::Ingest, request)
}

async fn transform_handler(State(state): State<Arc<AppState>>, Json(request): Json<RunRequest>) -> Response {
    start_stage(&state, Stage::Transform, request)
}

async fn run_all_handler(State(state): State<Arc<AppState>>, Json(request): Json<RunRequest>) -> Response {
    start_stage(&state, Stage::RunAll, request)
}

/// Acknowledge immediately; the run continues in the background.
fn start_stage(state: &AppState, stage: Stage, request: RunRequest) -> Response {
    let run = spawn_detached(state.runner.clone(), stage, request);
    info!(correlation_id = %run.correlation_id, stage = stage.label(), "run dispatched");
    (
        StatusCode::CREATED,
        Json(json!({
            "status": format!("Data {} started", stage.label()),
            "process_id": run.correlation_id,
        })),
    )
        .into_response()
}

async fn weekly_average_region_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RegionQuery>,
) -> Response {
    let params = BTreeMap::from([("region".to_string(), JsonValue::from(query.region))]);
    match state.runner.weekly_average(REGION_REPORT_KEY, params).await {
        Ok(rows) => Json(json!({"data": rows})).into_response(),
        Err(err) => not_found(err),
    }
}

async fn weekly_average_bounding_box_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BoundingBoxQuery>,
) -> Response {
    match state
        .runner
        .weekly_average(BOUNDING_BOX_REPORT_KEY, query.into_params())
        .await
    {
        Ok(rows) => Json(json!({"data": rows})).into_response(),
        Err(err) => not_found(err),
    }
}

fn not_found(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": err.to_string()})),
    )
        .into_response()
}
