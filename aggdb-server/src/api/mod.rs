//! HTTP API endpoints

use crate::index::IndexFile;
use aggdb_core::state::SegmentInfo;
use aggdb_core::{
    Aggregation, AggregationChunk, AggregationError, AggregationQuery, AggregationStats,
    AggregationStructure, ChunkId, ConsolidationStrategy, KeyType, KeyValue, LocalFsChunkStorage,
    MeasureValue, Record,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub aggregation: Arc<Aggregation<LocalFsChunkStorage>>,
    pub index: IndexFile,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Ingestion and queries
        .route("/consume", post(consume))
        .route("/query", post(query))
        .route("/estimate", post(estimate))

        // Chunk management
        .route("/consolidate", post(consolidate))
        .route("/chunks", get(list_chunks))
        .route("/segments", get(segments))

        // Stats
        .route("/stats", get(stats))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Aggregation(e) if e.is_config() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Records as JSON objects keyed by field name
#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    /// Measures carried by the records; every declared measure found in
    /// the records when omitted
    #[serde(default)]
    pub measures: Option<Vec<String>>,
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ConsolidateParams {
    strategy: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub added: Vec<ChunkId>,
    pub removed: Vec<ChunkId>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct EstimateResponse {
    pub chunks: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: aggdb_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn consume(
    State(state): State<AppState>,
    Json(req): Json<ConsumeRequest>,
) -> Result<Json<DiffResponse>, ApiError> {
    let structure = state.aggregation.structure();
    let measures = match req.measures {
        Some(measures) => measures,
        None => present_measures(structure, &req.records),
    };
    structure.validate_measures(&measures[..])?;

    let records = req
        .records
        .iter()
        .map(|row| to_record(structure, &measures, row))
        .collect::<Result<Vec<_>, _>>()?;
    let count = records.len();

    let diff = state.aggregation.consume_records(records, &measures[..]).await?;
    state.index.save_snapshot(&state.aggregation).await?;
    info!(records = count, chunks = diff.added.len(), "Consumed records");

    Ok(Json(DiffResponse {
        added: diff.added_ids(),
        removed: diff.removed_ids(),
    }))
}

async fn query(
    State(state): State<AppState>,
    Json(query): Json<AggregationQuery>,
) -> Result<Json<QueryResponse>, ApiError> {
    let records = state.aggregation.query(&query)?.collect().await?;
    let rows = records
        .iter()
        .map(|record| to_row(&query.keys, &query.measures, record))
        .collect();
    let columns = query.keys.iter().chain(query.measures.iter()).cloned().collect();
    Ok(Json(QueryResponse { columns, rows }))
}

async fn estimate(
    State(state): State<AppState>,
    Json(query): Json<AggregationQuery>,
) -> Result<Json<EstimateResponse>, ApiError> {
    let chunks = state.aggregation.estimate_cost(&query)?;
    Ok(Json(EstimateResponse { chunks }))
}

async fn consolidate(
    State(state): State<AppState>,
    Query(params): Query<ConsolidateParams>,
) -> Result<Json<DiffResponse>, ApiError> {
    let strategy = match params.strategy {
        Some(name) => name.parse::<ConsolidationStrategy>()?,
        None => ConsolidationStrategy::default(),
    };
    let diff = state.aggregation.consolidate(strategy).await?;
    if !diff.is_empty() {
        state.index.save_snapshot(&state.aggregation).await?;
    }
    Ok(Json(DiffResponse {
        added: diff.added_ids(),
        removed: diff.removed_ids(),
    }))
}

async fn list_chunks(State(state): State<AppState>) -> Json<Vec<AggregationChunk>> {
    Json(state.aggregation.state_snapshot())
}

async fn segments(State(state): State<AppState>) -> Json<Vec<SegmentInfo>> {
    Json(state.aggregation.consolidation_debug_info())
}

async fn stats(State(state): State<AppState>) -> Json<AggregationStats> {
    Json(state.aggregation.stats())
}

// ============================================================================
// JSON conversion
// ============================================================================

/// Declared measures that appear in any row, in declaration order
fn present_measures(structure: &AggregationStructure, rows: &[Map<String, Value>]) -> Vec<String> {
    structure
        .measures()
        .into_iter()
        .filter(|m| rows.iter().any(|row| row.contains_key(m)))
        .collect()
}

fn to_record(
    structure: &AggregationStructure,
    measures: &[String],
    row: &Map<String, Value>,
) -> Result<Record, ApiError> {
    let mut key = Vec::with_capacity(structure.keys().len());
    for (name, ty) in structure.keys().iter().zip(structure.key_types()) {
        let value = row
            .get(name)
            .ok_or_else(|| ApiError::BadRequest(format!("missing key '{}'", name)))?;
        key.push(to_key_value(name, *ty, value)?);
    }

    let mut values = Vec::with_capacity(measures.len());
    for name in measures {
        values.push(match row.get(name) {
            None | Some(Value::Null) => MeasureValue::Null,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => MeasureValue::Int(v),
                None => MeasureValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Some(other) => {
                return Err(ApiError::BadRequest(format!(
                    "measure '{}' is not a number: {}",
                    name, other
                )))
            }
        });
    }
    Ok(Record::new(key, values))
}

fn to_key_value(name: &str, ty: KeyType, value: &Value) -> Result<KeyValue, ApiError> {
    let converted = match ty {
        KeyType::Int => value.as_i64().map(KeyValue::Int),
        KeyType::String => value.as_str().map(KeyValue::from),
    };
    converted.ok_or_else(|| ApiError::BadRequest(format!("key '{}' is not of type {:?}: {}", name, ty, value)))
}

fn to_row(keys: &[String], measures: &[String], record: &Record) -> Map<String, Value> {
    let mut row = Map::new();
    for (name, value) in keys.iter().zip(record.key.values()) {
        let value = match value {
            KeyValue::Int(v) => Value::from(*v),
            KeyValue::String(s) => Value::from(s.as_str()),
        };
        row.insert(name.clone(), value);
    }
    for (name, value) in measures.iter().zip(&record.measures) {
        let value = match value {
            MeasureValue::Null => Value::Null,
            MeasureValue::Int(v) => Value::from(*v),
            MeasureValue::Float(v) => Value::from(*v),
        };
        row.insert(name.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggdb_core::measure;
    use aggdb_core::MeasureType;
    use serde_json::json;

    fn structure() -> AggregationStructure {
        AggregationStructure::new()
            .with_key("site", KeyType::String)
            .with_key("date", KeyType::Int)
            .with_measure("clicks", measure::sum(MeasureType::Int))
            .with_measure("revenue", measure::sum(MeasureType::Float))
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_json_row_to_record() {
        let row = object(json!({"date": 20240101, "site": "a", "revenue": 2.5}));
        let measures = vec!["clicks".to_string(), "revenue".to_string()];
        let record = to_record(&structure(), &measures, &row).unwrap();
        assert_eq!(
            record,
            Record::new(
                vec![KeyValue::from("a"), KeyValue::Int(20240101)],
                vec![MeasureValue::Null, MeasureValue::Float(2.5)]
            )
        );
        assert_eq!(present_measures(&structure(), &[row]), vec!["revenue".to_string()]);
    }

    #[test]
    fn test_bad_rows_are_rejected() {
        let measures = vec!["clicks".to_string()];
        let missing = object(json!({"site": "a", "clicks": 1}));
        assert!(matches!(
            to_record(&structure(), &measures, &missing),
            Err(ApiError::BadRequest(_))
        ));

        let wrong_type = object(json!({"site": 1, "date": 2, "clicks": 1}));
        assert!(matches!(
            to_record(&structure(), &measures, &wrong_type),
            Err(ApiError::BadRequest(_))
        ));

        let not_a_number = object(json!({"site": "a", "date": 2, "clicks": "many"}));
        assert!(to_record(&structure(), &measures, &not_a_number).is_err());
    }

    #[test]
    fn test_record_to_json_row() {
        let keys = vec!["site".to_string()];
        let measures = vec!["clicks".to_string(), "revenue".to_string()];
        let record = Record::new(
            vec![KeyValue::from("a")],
            vec![MeasureValue::Int(3), MeasureValue::Null],
        );
        assert_eq!(
            Value::Object(to_row(&keys, &measures, &record)),
            json!({"site": "a", "clicks": 3, "revenue": null})
        );
    }

    #[test]
    fn test_error_status() {
        let config = ApiError::from(AggregationError::UnknownKey("country".into()));
        assert_eq!(config.status(), StatusCode::BAD_REQUEST);
        let storage = ApiError::from(AggregationError::Storage("disk".into()));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
    }
}
