use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{BackendConnection, CellValue, ColumnInfo, ConnectionProvider, ResultRow, RowSet};
use crate::error::{untrusted, BackendError, QueryError, Stage};
use crate::sql::validator::mask_literals_and_comments;
use crate::sql::{
    compute_pagination, count_query, extract, is_select_shaped, paginate, to_dialect, DbTarget,
    PageWindow, PaginationCorrection, PaginationMetadata, PaginationPolicy, QueryValidator,
    SqlParam,
};

/// One query submission. Immutable once built.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    target: DbTarget,
    raw_text: String,
    page: i64,
    page_size: Option<i64>,
    explicit_params: Option<Vec<SqlParam>>,
    allow_write: bool,
}

impl QueryRequest {
    pub fn new(target: DbTarget, raw_text: impl Into<String>) -> Self {
        Self {
            target,
            raw_text: raw_text.into(),
            page: 1,
            page_size: None,
            explicit_params: None,
            allow_write: false,
        }
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    /// `None` takes the configured default page size.
    pub fn page_size(mut self, page_size: Option<i64>) -> Self {
        self.page_size = page_size;
        self
    }

    /// Pre-parameterized text with `?` placeholders; the extractor is skipped.
    pub fn with_params(mut self, params: Vec<SqlParam>) -> Self {
        self.explicit_params = Some(params);
        self
    }

    /// For trusted internal callers. Has no effect unless the executor was built
    /// with the write path enabled.
    pub fn allow_write(mut self) -> Self {
        self.allow_write = true;
        self
    }

    pub fn target(&self) -> DbTarget {
        self.target
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    pub columns: Vec<ColumnInfo>,
    pub pagination: PaginationMetadata,
    pub total_count: u64,
    pub corrections: Vec<PaginationCorrection>,
    #[serde(skip)]
    pub execution_time: Duration,
}

/// Runs validated, parameterized, paginated queries against a
/// [`ConnectionProvider`]. Holds no per-request state.
pub struct QueryExecutor {
    provider: Arc<dyn ConnectionProvider>,
    policy: PaginationPolicy,
    timeout: Duration,
    write_path: bool,
}

static RETURNS_ROWS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(RETURNING|OUTPUT)\b").expect("static pattern"));

impl QueryExecutor {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            policy: PaginationPolicy::default(),
            timeout: Duration::from_secs(30),
            write_path: false,
        }
    }

    pub fn with_policy(mut self, policy: PaginationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Permit requests marked `allow_write` to run non-SELECT statements.
    pub fn with_write_path(mut self, enabled: bool) -> Self {
        self.write_path = enabled;
        self
    }

    pub fn policy(&self) -> &PaginationPolicy {
        &self.policy
    }

    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        let started = Instant::now();
        let target = request.target;
        let result = self.execute_inner(request, started).await;
        match &result {
            Ok(r) => tracing::info!(
                target_db = %target,
                total = r.total_count,
                rows = r.rows.len(),
                page = r.pagination.page,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query executed"
            ),
            Err(e) => tracing::warn!(
                target_db = %target,
                kind = e.kind(),
                stage = %e.stage(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "query failed"
            ),
        }
        result
    }

    async fn execute_inner(
        &self,
        request: &QueryRequest,
        started: Instant,
    ) -> Result<QueryResult, QueryError> {
        let target = request.target;
        if request.raw_text.trim().is_empty() {
            return Err(QueryError::request_shape("query text is required"));
        }

        let validator = if request.allow_write && self.write_path {
            QueryValidator::trusted_writer()
        } else {
            QueryValidator::read_only()
        };
        let verdict = validator.validate(&request.raw_text);
        if !verdict.is_safe {
            tracing::warn!(
                target_db = %target,
                severity = %verdict.severity,
                query = %untrusted(&request.raw_text),
                "query rejected by validator"
            );
            return Err(QueryError::Validation {
                severity: verdict.severity,
                violations: verdict.reasons().into_iter().map(String::from).collect(),
            });
        }

        let (text, params) = match &request.explicit_params {
            Some(params) => (request.raw_text.clone(), params.clone()),
            None => {
                let extraction = extract(&request.raw_text);
                let params = extraction.values();
                (extraction.text, params)
            }
        };
        tracing::debug!(target_db = %target, params = params.len(), "parameters extracted");

        let dialect = target.dialect();
        let sql = to_dialect(dialect, &text, &params)
            .map_err(|e| QueryError::request_shape(e.to_string()))?;
        let select_shaped = is_select_shaped(dialect, &sql);
        if !select_shaped && !validator.allows_write() {
            return Err(QueryError::Validation {
                severity: crate::sql::Severity::High,
                violations: vec!["only SELECT queries are allowed in read-only mode".to_string()],
            });
        }
        let window = self.policy.window(request.page, request.page_size);

        let progress = AtomicU8::new(Stage::DialectAdapted as u8);
        let io = async {
            let mut conn = self
                .provider
                .acquire(target)
                .await
                .map_err(|source| connection_failure(target, source))?;
            progress.store(Stage::ConnectionAcquired as u8, Ordering::Relaxed);

            if select_shaped {
                read_page(conn.as_mut(), &sql, &params, &window, &progress).await
            } else {
                write_statement(conn.as_mut(), &sql, &params).await
            }
            // `conn` drops here: back to the pool, or discarded if cut off mid-query.
        };

        let (rows, total) = match tokio::time::timeout(self.timeout, io).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                let stage = Stage::from_u8(progress.load(Ordering::Relaxed) + 1);
                return Err(QueryError::Timeout {
                    stage,
                    timeout: self.timeout,
                });
            }
        };

        let pagination = if select_shaped {
            compute_pagination(window.page, window.page_size, total)
        } else {
            // The returned rows, or the marker row, form a single page.
            let shown = rows.rows.len() as u64;
            PaginationMetadata {
                total_records: total,
                ..compute_pagination(1, shown.max(1), shown)
            }
        };

        Ok(QueryResult {
            columns: rows.columns.clone(),
            rows: rows.into_mappings(),
            pagination,
            total_count: total,
            corrections: window.corrections,
            execution_time: started.elapsed(),
        })
    }

    /// Run a pre-parameterized query page by page until no page remains.
    pub async fn fetch_all(
        &self,
        target: DbTarget,
        sql: &str,
        params: Vec<SqlParam>,
    ) -> Result<Vec<ResultRow>, QueryError> {
        let page_size = self.policy.max_page_size as i64;
        let mut rows = Vec::new();
        let mut page = 1;
        loop {
            let request = QueryRequest::new(target, sql)
                .with_params(params.clone())
                .page(page)
                .page_size(Some(page_size));
            let result = self.execute(&request).await?;
            rows.extend(result.rows);
            if !result.pagination.has_next {
                return Ok(rows);
            }
            page += 1;
        }
    }

    /// Reachability check with a fixed `SELECT 1`, bypassing validation.
    pub async fn ping(&self, target: DbTarget) -> Result<(), QueryError> {
        if !self.provider.is_configured(target) {
            return Err(QueryError::Connection {
                target,
                source: BackendError::not_configured(target),
            });
        }
        let check = async {
            let mut conn = self
                .provider
                .acquire(target)
                .await
                .map_err(|source| connection_failure(target, source))?;
            conn.ping().await.map_err(|source| QueryError::Execution {
                target,
                stage: Stage::DataExecuted,
                source,
            })
        };
        match tokio::time::timeout(self.timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                stage: Stage::ConnectionAcquired,
                timeout: self.timeout,
            }),
        }
    }
}

/// Count then fetch one page, inside a read-only snapshot where supported.
async fn read_page(
    conn: &mut dyn BackendConnection,
    sql: &str,
    params: &[SqlParam],
    window: &PageWindow,
    progress: &AtomicU8,
) -> Result<(RowSet, u64), QueryError> {
    let target = conn.target();
    let snapshot = conn
        .begin_snapshot()
        .await
        .map_err(|e| backend_failure(target, Stage::CountExecuted, e))?;

    let outcome = count_and_fetch(conn, sql, params, window, progress).await;
    if snapshot {
        match &outcome {
            Ok(_) => conn
                .finish_snapshot(true)
                .await
                .map_err(|e| backend_failure(target, Stage::ResultShaped, e))?,
            Err(_) => {
                if let Err(e) = conn.finish_snapshot(false).await {
                    tracing::debug!(target_db = %target, error = %e, "rollback failed");
                }
            }
        }
    }
    outcome
}

async fn count_and_fetch(
    conn: &mut dyn BackendConnection,
    sql: &str,
    params: &[SqlParam],
    window: &PageWindow,
    progress: &AtomicU8,
) -> Result<(RowSet, u64), QueryError> {
    let target = conn.target();

    let counted = conn
        .query(&count_query(sql), params)
        .await
        .map_err(|e| backend_failure(target, Stage::CountExecuted, e))?;
    let total = counted
        .scalar()
        .and_then(CellValue::as_i64)
        .unwrap_or(0)
        .max(0) as u64;
    progress.store(Stage::CountExecuted as u8, Ordering::Relaxed);

    let paged = paginate(target.dialect(), sql, window.page, window.page_size);
    let rows = conn
        .query(&paged, params)
        .await
        .map_err(|e| backend_failure(target, Stage::DataExecuted, e))?;
    progress.store(Stage::DataExecuted as u8, Ordering::Relaxed);

    Ok((rows, total))
}

/// Non-SELECT statements run once; without a result set the page is a
/// single `affected_rows` marker row.
async fn write_statement(
    conn: &mut dyn BackendConnection,
    sql: &str,
    params: &[SqlParam],
) -> Result<(RowSet, u64), QueryError> {
    let target = conn.target();
    if RETURNS_ROWS_RE.is_match(&mask_literals_and_comments(sql)) {
        let rows = conn
            .query(sql, params)
            .await
            .map_err(|e| backend_failure(target, Stage::DataExecuted, e))?;
        let total = rows.rows.len() as u64;
        return Ok((rows, total));
    }

    let affected = conn
        .execute(sql, params)
        .await
        .map_err(|e| backend_failure(target, Stage::DataExecuted, e))?;
    let marker = RowSet::new(
        vec![ColumnInfo::new("affected_rows", "int8")],
        vec![vec![CellValue::Int64(affected as i64)]],
    );
    Ok((marker, affected))
}

fn connection_failure(target: DbTarget, source: BackendError) -> QueryError {
    tracing::warn!(target_db = %target, error = %source, "could not acquire connection");
    QueryError::Connection { target, source }
}

fn backend_failure(target: DbTarget, stage: Stage, source: BackendError) -> QueryError {
    tracing::error!(
        target_db = %target,
        stage = %stage,
        code = source.code.as_deref().unwrap_or(""),
        error = %source,
        "backend reported a fault"
    );
    QueryError::Execution {
        target,
        stage,
        source,
    }
}
