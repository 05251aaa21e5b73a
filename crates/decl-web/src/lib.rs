//! Axum JSON API over the collection engine.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use decl_core::{Filter, JobId, MAX_PAGE_SIZE};
use decl_storage::{records_to_csv, union_columns};
use decl_sync::{CollectionEngine, EngineError};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "decl-web";

/// Rows included inline by `/results/{task_id}`.
pub const PREVIEW_ROWS: usize = 50;

const EVICTION_SWEEP: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub engine: CollectionEngine,
}

impl AppState {
    pub fn new(engine: CollectionEngine) -> Self {
        Self { engine }
    }
}

/// Body of `POST /start`. Numeric fields accept numbers or numeric strings.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default, alias = "section")]
    pub row_name: Option<String>,
    #[serde(default)]
    pub year: Option<JsonValue>,
    #[serde(default)]
    pub declarant_type: Option<JsonValue>,
    #[serde(default, alias = "type")]
    pub t_type: Option<JsonValue>,
    #[serde(default)]
    pub inst_group: Option<JsonValue>,
    #[serde(default)]
    pub institution: Option<JsonValue>,
    #[serde(default)]
    pub offset: Option<JsonValue>,
    #[serde(default)]
    pub limit: Option<JsonValue>,
    #[serde(default)]
    pub retry_ids: Vec<JsonValue>,
}

fn loose_int(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn positive(value: Option<&JsonValue>) -> Option<i64> {
    loose_int(value).filter(|v| *v > 0)
}

impl StartRequest {
    /// None when the section or a positive year is missing. Non-positive
    /// optional criteria are treated as unset.
    pub fn into_filter(self) -> Option<Filter> {
        let section = self.row_name.filter(|s| !s.trim().is_empty())?;
        let year = i32::try_from(positive(self.year.as_ref())?).ok()?;

        let mut filter = Filter::new(section, year);
        filter.declarant_type = positive(self.declarant_type.as_ref());
        filter.declaration_type = positive(self.t_type.as_ref());
        filter.institution_group = positive(self.inst_group.as_ref());
        filter.institution = positive(self.institution.as_ref());
        filter.offset = loose_int(self.offset.as_ref())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        filter.limit = positive(self.limit.as_ref())
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(MAX_PAGE_SIZE);
        filter.retry_ids = self
            .retry_ids
            .iter()
            .filter_map(|v| loose_int(Some(v)))
            .collect();
        Some(filter)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/status/{task_id}", get(status_handler))
        .route("/stop/{task_id}", post(stop_handler))
        .route("/results/{task_id}", get(results_handler))
        .route("/download/{task_id}", get(download_handler))
        .route("/history", get(history_handler))
        .route("/sections", get(sections_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: CollectionEngine, port: u16) -> anyhow::Result<()> {
    let _sweeper = engine.spawn_eviction_sweeper(EVICTION_SWEEP);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "collection API listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Response {
    let Some(filter) = request.into_filter() else {
        return json_error(StatusCode::BAD_REQUEST, "MISSING_FIELDS");
    };
    match state.engine.start_job(filter) {
        Ok(task_id) => Json(json!({ "task_id": task_id })).into_response(),
        Err(err @ EngineError::CapacityExceeded { .. }) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Err(err @ (EngineError::InvalidFilter(_) | EngineError::Section(_))) => {
            json_error(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err) => server_error(err.into()),
    }
}

fn parse_task_id(raw: &str) -> Option<JobId> {
    Uuid::parse_str(raw).ok()
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let status = parse_task_id(&task_id).and_then(|id| state.engine.query_status(id).ok());
    match status {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "status": "unknown" }))).into_response(),
    }
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let success = parse_task_id(&task_id)
        .map(|id| state.engine.request_stop(id))
        .unwrap_or(false);
    Json(json!({ "success": success })).into_response()
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let Some(id) = parse_task_id(&task_id) else {
        return json_error(StatusCode::NOT_FOUND, "Result file not found or expired.");
    };
    match state.engine.store().load(id).await {
        Ok(Some(dataset)) => {
            let columns = union_columns(&dataset.records);
            let preview = &dataset.records[..dataset.records.len().min(PREVIEW_ROWS)];
            Json(json!({
                "task_id": id,
                "total_rows": dataset.records.len(),
                "columns": columns,
                "preview": preview,
                "failed_ids": dataset.metadata.failed_ids,
                "metadata": dataset.metadata,
            }))
            .into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Result file not found or expired."),
        Err(err) => server_error(err),
    }
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let Some(id) = parse_task_id(&task_id) else {
        return json_error(StatusCode::NOT_FOUND, "File expired or deleted.");
    };
    match state.engine.store().load(id).await {
        Ok(Some(dataset)) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"declarations_{id}.csv\""),
                ),
            ],
            records_to_csv(&dataset.records),
        )
            .into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "File expired or deleted."),
        Err(err) => server_error(err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.store().history().await {
        Ok(items) => Json(items).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sections_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.catalog().entries()).into_response()
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Server error: {err}"))
}
