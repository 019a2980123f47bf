//! Axum JSON API for UNVR: health, store status, run history, featured picks and manual ETL triggers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use unvr_core::{DataSource, FeaturedSelection, RecentUpdate, RunRecord, StatusCount};
use unvr_storage::StoreError;
use unvr_sync::{select_featured, SyncError, SyncPipeline, DEFAULT_FEATURED_LIMIT};

pub const CRATE_NAME: &str = "unvr-web";

const RECENT_UPDATES_LIMIT: usize = 20;
const RECENT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;
const MAX_FEATURED_LIMIT: usize = 50;
/// Today and tomorrow.
const DEFAULT_EXPIRING_DAYS: u32 = 2;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub counts: Vec<StatusCount>,
    pub recent_updates: Vec<RecentUpdate>,
    pub recent_runs: Vec<RunRecord>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FeaturedQuery {
    kind: Option<String>,
    days: Option<u32>,
    network: Option<String>,
    limit: Option<usize>,
}

impl FeaturedQuery {
    fn selection(&self) -> Result<FeaturedSelection, String> {
        match self.kind.as_deref().unwrap_or("expiring_soon") {
            "expiring_soon" => Ok(FeaturedSelection::ExpiringSoon {
                days: self.days.unwrap_or(DEFAULT_EXPIRING_DAYS),
            }),
            "job_network" => match self.network.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Ok(FeaturedSelection::JobNetwork {
                    name: name.to_string(),
                }),
                _ => Err("job_network selection needs a `network` parameter".to_string()),
            },
            other => Err(format!("unknown featured kind `{other}`")),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/status/runs", get(runs_handler))
        .route("/featured", get(featured_handler))
        .route("/etl/{source}", post(trigger_etl_handler))
        .with_state(Arc::new(state))
}

/// Bind `0.0.0.0:{web_port}` and serve until the process stops.
pub async fn serve(pipeline: Arc<SyncPipeline>) -> anyhow::Result<()> {
    let port = pipeline.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "unvr web listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.pipeline.store();
    let tracker = state.pipeline.tracker();
    let status = async {
        Ok::<_, StoreError>(StatusResponse {
            counts: store.status_counts().await?,
            recent_updates: store.recent_updates(RECENT_UPDATES_LIMIT).await?,
            recent_runs: tracker.recent_runs(RECENT_RUNS_LIMIT).await?,
        })
    }
    .await;
    match status {
        Ok(body) => Json(body).into_response(),
        Err(err) => store_error(err),
    }
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(RECENT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    match state.pipeline.tracker().recent_runs(limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn featured_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeaturedQuery>,
) -> Response {
    let selection = match query.selection() {
        Ok(selection) => selection,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FEATURED_LIMIT)
        .min(MAX_FEATURED_LIMIT);
    let store = state.pipeline.store();
    let base_url = &state.pipeline.config().public_base_url;
    match select_featured(store.as_ref(), &selection, limit, Utc::now(), base_url).await {
        Ok(featured) => Json(featured).into_response(),
        Err(err) => store_error(err),
    }
}

async fn trigger_etl_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Response {
    let source = match source.parse::<DataSource>() {
        Ok(source) => source,
        Err(err) => return error_response(StatusCode::NOT_FOUND, err.to_string()),
    };
    info!(%source, "manual etl trigger");
    match state.pipeline.run_etl(source).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ SyncError::RunInProgress(_)) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        Err(SyncError::Store(err)) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    warn!(error = %err, "store request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
