use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::AppState;
use crate::db::ResultRow;
use crate::error::QueryError;
use crate::executor::{QueryRequest, QueryResult};
use crate::export::ExportFormat;
use crate::nl::{schema_context, validate_prompt};
use crate::parcels::{self, ParcelFilter};
use crate::schema;
use crate::sql::{DbTarget, PaginationCorrection, PaginationMetadata};

#[derive(Debug, Deserialize)]
pub struct RunQueryBody {
    db: DbTarget,
    query: String,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    page_size: Option<i64>,
}

impl RunQueryBody {
    fn request(&self) -> QueryRequest {
        QueryRequest::new(self.db, self.query.as_str())
            .page(self.page.unwrap_or(1))
            .page_size(self.page_size)
    }
}

#[derive(Debug, Serialize)]
pub struct RunQueryResponse {
    status: &'static str,
    data: Vec<ResultRow>,
    count: u64,
    pagination: PaginationMetadata,
    columns: Vec<String>,
    corrections: Vec<PaginationCorrection>,
    execution_time_ms: u64,
}

impl From<QueryResult> for RunQueryResponse {
    fn from(result: QueryResult) -> Self {
        Self {
            status: "success",
            columns: result.columns.iter().map(|c| c.name.clone()).collect(),
            execution_time_ms: result.execution_time.as_millis() as u64,
            count: result.total_count,
            pagination: result.pagination,
            corrections: result.corrections,
            data: result.rows,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let (mssql, postgres) = tokio::join!(
        state.executor.ping(DbTarget::MsSql),
        state.executor.ping(DbTarget::Postgres)
    );
    let up = |target: DbTarget, result: Result<(), QueryError>| match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(target_db = %target, error = %e, "health check failed");
            false
        }
    };

    Json(json!({
        "status": "success",
        "message": "API is operational",
        "timestamp": Utc::now().to_rfc3339(),
        "database_status": {
            "mssql": up(DbTarget::MsSql, mssql),
            "postgres": up(DbTarget::Postgres, postgres),
        }
    }))
}

pub async fn run_query(
    State(state): State<AppState>,
    payload: Result<Json<RunQueryBody>, JsonRejection>,
) -> Result<Json<RunQueryResponse>, ApiError> {
    let Json(body) = payload?;
    let result = state.executor.execute(&body.request()).await?;
    Ok(Json(result.into()))
}

#[derive(Debug, Deserialize)]
pub struct NlBody {
    db: DbTarget,
    prompt: String,
}

pub async fn nl_to_sql(
    State(state): State<AppState>,
    payload: Result<Json<NlBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;

    let verdict = validate_prompt(&body.prompt);
    if !verdict.is_safe {
        return Err(QueryError::Validation {
            severity: verdict.severity,
            violations: verdict.reasons().into_iter().map(String::from).collect(),
        }
        .into());
    }

    let translation = state
        .translator
        .translate(&body.prompt, body.db, &schema_context(body.db))
        .await
        .map_err(|e| {
            tracing::error!(target_db = %body.db, error = %e, "translation failed");
            ApiError::Internal("translation failed".to_string())
        })?;

    Ok(Json(json!({
        "status": "success",
        "sql": translation.sql,
        "explanation": translation.explanation,
        "warnings": verdict.reasons(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    #[serde(flatten)]
    query: RunQueryBody,
    #[serde(default)]
    format: ExportFormat,
}

pub async fn export(
    State(state): State<AppState>,
    payload: Result<Json<ExportBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;
    let result = state.executor.execute(&body.query.request()).await?;
    let format = body.format;
    let disposition = format!("attachment; filename=\"export.{}\"", format.extension());

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        format.render(&result),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct DbParam {
    db: DbTarget,
}

pub async fn discover_schema(
    State(state): State<AppState>,
    params: Result<Query<DbParam>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params?;
    let discovery = schema::discover(&state.executor, params.db).await?;
    Ok(Json(json!({
        "status": "success",
        "timestamp": Utc::now().to_rfc3339(),
        "database": discovery.database,
        "schema": discovery.schema,
        "tables": discovery.tables,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    db: DbTarget,
    #[serde(default)]
    prefix: Option<String>,
}

pub async fn schema_summary(
    State(state): State<AppState>,
    params: Result<Query<SummaryParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params?;
    let prefix = params.prefix.as_deref();
    let tables = schema::summary(&state.executor, params.db, prefix).await?;
    Ok(Json(json!({
        "status": "success",
        "timestamp": Utc::now().to_rfc3339(),
        "database": params.db,
        "filtered": prefix.is_some_and(|p| !p.trim().is_empty()),
        "table_count": tables.len(),
        "tables": tables,
    })))
}

/// Query strings arrive as text, so the filter fields are spelled out here
/// rather than flattened.
#[derive(Debug, Deserialize)]
pub struct ParcelListParams {
    #[serde(default)]
    db: Option<DbTarget>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    min_value: Option<f64>,
    #[serde(default)]
    max_value: Option<f64>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    per_page: Option<i64>,
}

pub async fn list_parcels(
    State(state): State<AppState>,
    params: Result<Query<ParcelListParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = params?;
    let target = params.db.unwrap_or(DbTarget::Postgres);
    let filter = ParcelFilter {
        city: params.city,
        state: params.state,
        min_value: params.min_value,
        max_value: params.max_value,
    };
    let result = parcels::list(
        &state.executor,
        target,
        &filter,
        params.page.unwrap_or(1),
        params.per_page,
    )
    .await?;
    Ok(Json(json!({
        "status": "success",
        "data": result.rows,
        "count": result.total_count,
        "pagination": result.pagination,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ParcelDetailParams {
    #[serde(default)]
    db: Option<DbTarget>,
}

pub async fn parcel_detail(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
    params: Result<Query<ParcelDetailParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(id) = id?;
    let Query(params) = params?;
    let target = params.db.unwrap_or(DbTarget::Postgres);
    match parcels::detail(&state.executor, target, id).await? {
        Some(detail) => Ok(Json(json!({
            "status": "success",
            "data": detail,
        }))),
        None => Err(ApiError::NotFound(format!("parcel {} not found", id))),
    }
}

#[cfg(test)]
mod tests {
    use crate::db::mock::{MockProvider, MockResult};
    use crate::db::CellValue;
    use crate::executor::QueryExecutor;
    use crate::nl::FallbackTranslator;
    use crate::server::{router, ApiKeyGate, AppState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    const KEY: &str = "test-api-key-123";

    fn app(provider: &MockProvider) -> Router {
        let state = AppState::new(
            QueryExecutor::new(Arc::new(provider.clone())),
            Arc::new(FallbackTranslator::offline()),
            ApiKeyGate::new("x-api-key", Some(KEY)),
        );
        router(state, &["http://localhost:5000".to_string()])
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-api-key", KEY)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    async fn send_json(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, _, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn parcels() -> MockProvider {
        MockProvider::new().with_table(
            &["id", "owner_name"],
            vec![
                vec![CellValue::Int32(7), CellValue::Text("Jane Smith".into())],
                vec![CellValue::Int32(9), CellValue::Text("Jane Smith".into())],
            ],
        )
    }

    #[tokio::test]
    async fn test_health_is_open_and_reports_backends() {
        let provider = MockProvider::new().only(&[crate::sql::DbTarget::Postgres]);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send_json(app(&provider), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database_status"]["postgres"], true);
        assert_eq!(body["database_status"]["mssql"], false);
        assert_eq!(provider.log().sql(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_protected_routes_require_key() {
        let provider = parcels();
        let request = Request::builder()
            .method("POST")
            .uri("/run-query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"db":"mssql","query":"SELECT * FROM parcels"}"#))
            .unwrap();
        let (status, body) = send_json(app(&provider), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "authentication_error");
        assert!(provider.log().acquired.is_empty());
    }

    #[tokio::test]
    async fn test_run_query_success() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post(
                "/run-query",
                serde_json::json!({
                    "db": "A",
                    "query": "SELECT * FROM parcels WHERE owner_name = 'Jane Smith'",
                    "page": 1,
                    "page_size": 10
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["count"], 2);
        assert_eq!(body["pagination"]["page"], 1);
        assert_eq!(body["data"][0]["owner_name"], "Jane Smith");
        assert_eq!(body["columns"], serde_json::json!(["id", "owner_name"]));

        let log = provider.log();
        let (data_sql, params) = &log.statements[1];
        assert!(data_sql.contains("owner_name = @P1"));
        assert_eq!(params, &vec![crate::sql::SqlParam::from("Jane Smith")]);
    }

    #[tokio::test]
    async fn test_run_query_reports_corrections() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post(
                "/run-query",
                serde_json::json!({"db": "postgres", "query": "SELECT * FROM parcels", "page_size": 0}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["page_size"], 1);
        assert_eq!(body["corrections"][0]["field"], "page_size");
    }

    #[tokio::test]
    async fn test_run_query_rejects_drop() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "A", "query": "DROP TABLE parcels"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");
        assert!(body["violations"].as_array().is_some_and(|v| !v.is_empty()));
        assert!(provider.log().acquired.is_empty());
    }

    #[tokio::test]
    async fn test_run_query_bad_body() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "oracle", "query": "SELECT 1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "request_shape_error");

        let (status, _) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "A", "query": "SELECT 1", "page": "two"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backend_fault_is_generic() {
        let provider = parcels().respond(
            "FROM parcels",
            MockResult::Fail(crate::error::BackendError::new(
                crate::error::ErrorCategory::Semantic,
                "column \"ssn\" does not exist",
            )),
        );
        let (status, body) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "B", "query": "SELECT ssn FROM parcels"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "query execution failed");
        assert_eq!(body["stage"], "count_executed");
        assert!(!body.to_string().contains("ssn"));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_unavailable() {
        let provider = parcels().only(&[crate::sql::DbTarget::MsSql]);
        let (status, body) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "postgres", "query": "SELECT * FROM parcels"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "connection_error");
    }

    #[tokio::test]
    async fn test_export_csv() {
        let provider = parcels();
        let (status, headers, body) = send(
            app(&provider),
            post(
                "/export",
                serde_json::json!({"db": "A", "query": "SELECT * FROM parcels", "format": "csv"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/csv; charset=utf-8");
        assert!(headers["content-disposition"].to_str().unwrap().contains("export.csv"));
        assert_eq!(
            String::from_utf8(body).unwrap(),
            "id,owner_name\r\n7,Jane Smith\r\n9,Jane Smith\r\n"
        );
    }

    #[tokio::test]
    async fn test_nl_to_sql() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post("/nl-to-sql", serde_json::json!({"db": "postgres", "prompt": "show recent sales"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sql"].as_str().unwrap().starts_with("SELECT * FROM sales"));
        assert!(provider.log().acquired.is_empty());

        let (status, body) = send_json(
            app(&provider),
            post("/nl-to-sql", serde_json::json!({"db": "postgres", "prompt": "<script>x</script> parcels"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_schema_summary_prefix_is_bound() {
        let provider = MockProvider::new()
            .respond(
                "information_schema.tables",
                MockResult::Rows(crate::db::RowSet::new(
                    vec![crate::db::ColumnInfo::new("table_name", "text")],
                    vec![vec![CellValue::Text("parcels".into())]],
                )),
            )
            .respond(
                "information_schema.columns",
                MockResult::Rows(crate::db::RowSet::new(
                    vec![
                        crate::db::ColumnInfo::new("column_name", "text"),
                        crate::db::ColumnInfo::new("data_type", "text"),
                    ],
                    vec![vec![CellValue::Text("id".into()), CellValue::Text("integer".into())]],
                )),
            );
        let (status, body) = send_json(
            app(&provider),
            get("/schema-summary?db=postgres&prefix=parc"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filtered"], true);
        assert_eq!(body["tables"][0], "parcels: id (integer)");

        let log = provider.log();
        assert!(log.statements.iter().any(|(sql, params)| sql.contains("LIKE")
            && params.contains(&crate::sql::SqlParam::from("parc%"))));
        assert!(!log.sql().iter().any(|sql| sql.contains("'parc")));
    }

    #[tokio::test]
    async fn test_schema_summary_rejects_long_prefix() {
        let provider = MockProvider::new();
        let uri = format!("/schema-summary?db=mssql&prefix={}", "p".repeat(51));
        let (status, body) = send_json(app(&provider), get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "request_shape_error");
    }

    #[tokio::test]
    async fn test_acquire_failure_hides_driver_text() {
        let provider = parcels().failing_acquire(crate::error::BackendError::connection(
            "password authentication failed for user \"assessor_admin\" at 10.2.3.4:5432",
        ));
        let (status, body) = send_json(
            app(&provider),
            post("/run-query", serde_json::json!({"db": "B", "query": "SELECT * FROM parcels"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "connection_error");
        assert_eq!(body["stage"], "connection_acquired");
        assert_eq!(body["message"], "postgres connection unavailable");
        let text = body.to_string();
        assert!(!text.contains("assessor_admin"));
        assert!(!text.contains("10.2.3.4"));
        assert!(provider.log().statements.is_empty());
    }

    #[tokio::test]
    async fn test_run_query_rejects_system_catalog() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            post(
                "/run-query",
                serde_json::json!({"db": "A", "query": "SELECT name, password_hash FROM sys.sql_logins"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");
        assert!(provider.log().acquired.is_empty());
    }

    #[tokio::test]
    async fn test_list_parcels_binds_filters() {
        let provider = parcels();
        let (status, body) = send_json(
            app(&provider),
            get("/api/parcels?city=Springfield&state=IL&min_value=100000&max_value=900000&page=1&per_page=5"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["count"], 2);
        assert_eq!(body["pagination"]["page_size"], 5);
        assert_eq!(body["data"][1]["id"], 9);

        let log = provider.log();
        let (data_sql, params) = &log.statements[2];
        assert!(data_sql.contains(
            "WHERE city = $1 AND state = $2 AND total_value >= $3 AND total_value <= $4"
        ));
        assert!(data_sql.ends_with("LIMIT 5 OFFSET 0"));
        assert_eq!(
            params,
            &vec![
                crate::sql::SqlParam::from("Springfield"),
                crate::sql::SqlParam::from("IL"),
                crate::sql::SqlParam::Float(100000.0),
                crate::sql::SqlParam::Float(900000.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_parcels_requires_key() {
        let provider = parcels();
        let request = Request::builder().uri("/api/parcels").body(Body::empty()).unwrap();
        let (status, _) = send_json(app(&provider), request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(provider.log().acquired.is_empty());
    }

    #[tokio::test]
    async fn test_parcel_detail_found() {
        let provider = parcels();
        let (status, body) = send_json(app(&provider), get("/api/parcels/7?db=mssql")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], 7);
        assert!(body["data"]["property_details"].is_array());
        assert!(body["data"]["sales_history"].is_array());

        let log = provider.log();
        assert_eq!(log.statements[1].1, vec![crate::sql::SqlParam::Integer(7)]);
        assert!(log.sql()[1].contains("FROM parcels WHERE id = @P1"));
    }

    #[tokio::test]
    async fn test_parcel_detail_unknown_id() {
        let provider = MockProvider::new();
        let (status, body) = send_json(app(&provider), get("/api/parcels/404")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_parcel_detail_bad_id() {
        let provider = MockProvider::new();
        let (status, body) = send_json(app(&provider), get("/api/parcels/abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "request_shape_error");
        assert!(provider.log().acquired.is_empty());
    }

    #[tokio::test]
    async fn test_discover_schema_missing_db() {
        let provider = MockProvider::new();
        let (status, body) = send_json(app(&provider), get("/discover-schema")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }
}
