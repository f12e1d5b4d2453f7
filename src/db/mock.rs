//! Scriptable in-memory `ConnectionProvider` for tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::provider::{BackendConnection, ConnectionProvider};
use super::value::{CellValue, ColumnInfo, RowSet};
use crate::error::BackendError;
use crate::sql::{DbTarget, SqlParam};

#[derive(Debug, Clone)]
pub enum MockResult {
    Rows(RowSet),
    Affected(u64),
    Fail(BackendError),
}

/// What the provider observed.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub acquired: Vec<DbTarget>,
    pub released: usize,
    pub discarded: usize,
    pub statements: Vec<(String, Vec<SqlParam>)>,
}

impl MockLog {
    pub fn sql(&self) -> Vec<&str> {
        self.statements.iter().map(|(s, _)| s.as_str()).collect()
    }
}

struct MockState {
    table: RowSet,
    rules: Vec<(String, MockResult)>,
    configured: Vec<DbTarget>,
    delay: Option<Duration>,
    acquire_error: Option<BackendError>,
    closed: bool,
    log: MockLog,
}

#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    /// Both backends configured, serving an empty table.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                table: RowSet::default(),
                rules: Vec::new(),
                configured: DbTarget::ALL.to_vec(),
                delay: None,
                acquire_error: None,
                closed: false,
                log: MockLog::default(),
            })),
        }
    }

    /// Rows served for data queries; count queries report their number.
    pub fn with_table(self, columns: &[&str], rows: Vec<Vec<CellValue>>) -> Self {
        self.lock().table = RowSet::new(
            columns.iter().map(|c| ColumnInfo::new(*c, "text")).collect(),
            rows,
        );
        self
    }

    /// Answer any statement containing `pattern` with `result`. Earlier
    /// rules win.
    pub fn respond(self, pattern: &str, result: MockResult) -> Self {
        self.lock().rules.push((pattern.to_string(), result));
        self
    }

    pub fn only(self, targets: &[DbTarget]) -> Self {
        self.lock().configured = targets.to_vec();
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    pub fn failing_acquire(self, err: BackendError) -> Self {
        self.lock().acquire_error = Some(err);
        self
    }

    pub fn log(&self) -> MockLog {
        self.lock().log.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn acquire(&self, target: DbTarget) -> Result<Box<dyn BackendConnection>, BackendError> {
        let mut state = self.lock();
        if state.closed || !state.configured.contains(&target) {
            return Err(BackendError::not_configured(target));
        }
        if let Some(err) = &state.acquire_error {
            return Err(err.clone());
        }
        state.log.acquired.push(target);
        Ok(Box::new(MockConnection {
            target,
            state: self.state.clone(),
            in_flight: false,
        }))
    }

    fn is_configured(&self, target: DbTarget) -> bool {
        self.lock().configured.contains(&target)
    }

    async fn close_all(&self) {
        self.lock().closed = true;
    }
}

struct MockConnection {
    target: DbTarget,
    state: Arc<Mutex<MockState>>,
    in_flight: bool,
}

impl MockConnection {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(&mut self, sql: &str, params: &[SqlParam]) -> MockResult {
        self.in_flight = true;
        let delay = {
            let mut state = self.lock();
            state.log.statements.push((sql.to_string(), params.to_vec()));
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        let result = match state.rules.iter().find(|(p, _)| sql.contains(p.as_str())) {
            Some((_, result)) => result.clone(),
            None if sql.starts_with("SELECT COUNT(*)") => MockResult::Rows(RowSet::new(
                vec![ColumnInfo::new("count", "int8")],
                vec![vec![CellValue::Int64(state.table.rows.len() as i64)]],
            )),
            None => MockResult::Rows(state.table.clone()),
        };
        drop(state);
        self.in_flight = false;
        result
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    fn target(&self) -> DbTarget {
        self.target
    }

    async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet, BackendError> {
        match self.run(sql, params).await {
            MockResult::Rows(rows) => Ok(rows),
            MockResult::Affected(_) => Ok(RowSet::default()),
            MockResult::Fail(err) => Err(err),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, BackendError> {
        match self.run(sql, params).await {
            MockResult::Rows(rows) => Ok(rows.rows.len() as u64),
            MockResult::Affected(n) => Ok(n),
            MockResult::Fail(err) => Err(err),
        }
    }

    async fn begin_snapshot(&mut self) -> Result<bool, BackendError> {
        if self.target == DbTarget::MsSql {
            return Ok(false);
        }
        self.lock().log.statements.push(("BEGIN".to_string(), Vec::new()));
        Ok(true)
    }

    async fn finish_snapshot(&mut self, commit: bool) -> Result<(), BackendError> {
        let stmt = if commit { "COMMIT" } else { "ROLLBACK" };
        self.lock().log.statements.push((stmt.to_string(), Vec::new()));
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let in_flight = self.in_flight;
        let mut state = self.lock();
        if in_flight {
            state.log.discarded += 1;
        } else {
            state.log.released += 1;
        }
    }
}
