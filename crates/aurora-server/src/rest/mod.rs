//! REST API endpoints using Axum
//!
//! Catalog routes live under `/iceberg/v1`, with an optional `{prefix}`
//! segment, and delegate to the configured [`CatalogBackend`]. The metrics
//! routes are in [`metrics`].

pub mod metrics;

use crate::catalog::{CatalogBackend, CatalogError};
use crate::middleware::{
    filter_chain_middleware, metrics_middleware, response_header_limit, FilterChain,
    RequestFilter, RequestMetrics,
};
use crate::types::*;
use aurora_metrics::{MetricEvent, MetricsSink, ServerMetrics};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogBackend>,
    pub sink: Arc<dyn MetricsSink>,
    pub server_metrics: Arc<ServerMetrics>,
    pub catalog_config: Arc<CatalogConfigResponse>,
}

/// Filters wrapped around the routes
#[derive(Clone, Default)]
pub struct AppFilters {
    pub authenticator: Option<Arc<dyn RequestFilter>>,
    pub custom: FilterChain,
    pub response_header_size: usize,
}

// ============================================================================
// Router Setup
// ============================================================================

fn table_routes() -> Router<AppState> {
    Router::new()
        .route("/config", get(get_config))
        .route(
            "/namespaces/{namespace}/tables",
            get(list_tables).post(create_table),
        )
        .route(
            "/namespaces/{namespace}/tables/{table}",
            get(load_table).delete(drop_table),
        )
        .route(
            "/namespaces/{namespace}/tables/{table}/metrics",
            post(report_metrics),
        )
        .route("/tables/rename", post(rename_table))
}

/// Catalog routes, to be nested under `/iceberg`
pub fn create_catalog_router() -> Router<AppState> {
    Router::new()
        .nest("/v1", table_routes())
        .nest("/v1/{prefix}", table_routes())
}

/// Full application: routes plus the filter stack.
///
/// Layers, outermost first: request tracing, response header limit,
/// authenticator, request metrics, custom filters, panic catcher.
pub fn create_app(state: AppState, filters: AppFilters) -> Router {
    let request_metrics = RequestMetrics {
        registry: Arc::clone(&state.server_metrics),
        sink: Arc::clone(&state.sink),
    };

    let mut app = Router::new()
        .nest("/iceberg", create_catalog_router())
        .merge(metrics::create_metrics_router())
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic));

    if !filters.custom.is_empty() {
        app = app.layer(middleware::from_fn_with_state(
            Arc::new(filters.custom),
            filter_chain_middleware,
        ));
    }

    app = app.layer(middleware::from_fn_with_state(
        request_metrics,
        metrics_middleware,
    ));

    if let Some(authenticator) = filters.authenticator {
        app = app.layer(middleware::from_fn_with_state(
            Arc::new(FilterChain::new(vec![authenticator])),
            filter_chain_middleware,
        ));
    }

    if filters.response_header_size > 0 {
        app = app.layer(middleware::from_fn_with_state(
            filters.response_header_size,
            response_header_limit,
        ));
    }

    app.layer(TraceLayer::new_for_http())
}

async fn not_found() -> ApiError {
    ApiError::NotFound("No route matches the request".into())
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    ApiError::Internal(format!("Handler panicked: {detail}")).into_response()
}

// ============================================================================
// Catalog Endpoints
// ============================================================================

type Params = Path<HashMap<String, String>>;

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest(format!("Missing path parameter '{key}'")))
}

fn table_id(params: &HashMap<String, String>) -> Result<TableIdentifier, ApiError> {
    Ok(TableIdentifier::from_path(
        param(params, "namespace")?,
        param(params, "table")?,
    ))
}

/// GET /iceberg/v1/[{prefix}/]config
async fn get_config(State(state): State<AppState>) -> Json<CatalogConfigResponse> {
    Json(state.catalog_config.as_ref().clone())
}

/// GET /iceberg/v1/[{prefix}/]namespaces/{namespace}/tables
async fn list_tables(
    State(state): State<AppState>,
    Path(params): Params,
) -> Result<Json<ListTablesResponse>, ApiError> {
    let namespace = split_namespace(param(&params, "namespace")?);
    let identifiers = state.catalog.list_tables(&namespace)?;
    Ok(Json(ListTablesResponse { identifiers }))
}

/// POST /iceberg/v1/[{prefix}/]namespaces/{namespace}/tables
async fn create_table(
    State(state): State<AppState>,
    Path(params): Params,
    payload: Result<Json<CreateTableRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LoadTableResponse>), ApiError> {
    let Json(request) = payload?;
    let namespace = split_namespace(param(&params, "namespace")?);
    let (identifier, metadata) = state.catalog.create_table(&namespace, request)?;
    Ok((
        StatusCode::OK,
        Json(LoadTableResponse {
            identifier,
            metadata_location: metadata.location.clone(),
            metadata,
        }),
    ))
}

/// GET /iceberg/v1/[{prefix}/]namespaces/{namespace}/tables/{table}
async fn load_table(
    State(state): State<AppState>,
    Path(params): Params,
) -> Result<Json<LoadTableResponse>, ApiError> {
    let identifier = table_id(&params)?;
    let metadata = state.catalog.load_table(&identifier)?;
    Ok(Json(LoadTableResponse {
        identifier,
        metadata_location: metadata.location.clone(),
        metadata,
    }))
}

/// DELETE /iceberg/v1/[{prefix}/]namespaces/{namespace}/tables/{table}
async fn drop_table(
    State(state): State<AppState>,
    Path(params): Params,
    query: Result<Query<DropTableQuery>, QueryRejection>,
) -> Result<StatusCode, ApiError> {
    let Query(query) = query?;
    let identifier = table_id(&params)?;
    if state.catalog.drop_table(&identifier, query.purge_requested)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CatalogError::NoSuchTable(identifier).into())
    }
}

/// POST /iceberg/v1/[{prefix}/]tables/rename
async fn rename_table(
    State(state): State<AppState>,
    payload: Result<Json<RenameTableRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload?;
    state
        .catalog
        .rename_table(&request.source, &request.destination)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /iceberg/v1/[{prefix}/]namespaces/{namespace}/tables/{table}/metrics
///
/// Client reports are recorded as `iceberg.report.<report-type>` events.
async fn report_metrics(
    State(state): State<AppState>,
    Path(params): Params,
    payload: Result<Json<ReportMetricsRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(report) = payload?;
    let identifier = table_id(&params)?;
    if report.report_type.trim().is_empty() {
        return Err(ApiError::BadRequest("report-type must not be blank".into()));
    }

    let mut event = MetricEvent::new(format!("iceberg.report.{}", report.report_type))
        .with_tag("table", identifier.to_string());
    if let Some(snapshot_id) = report.snapshot_id {
        event = event.with_tag("snapshot-id", snapshot_id.to_string());
    }
    for (key, value) in report.metrics {
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        event = event.with_tag(key, value);
    }
    state.sink.record(event);

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NoSuchTable(_) => ApiError::NotFound(err.to_string()),
            CatalogError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            CatalogError::BadRequest(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "already_exists", msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(ErrorResponse::new(error_code, message))).into_response()
    }
}
