use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::sql::{DbTarget, Severity};

/// Pipeline position of a request. Errors record the stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    Received,
    Validated,
    ParamsExtracted,
    DialectAdapted,
    ConnectionAcquired,
    CountExecuted,
    DataExecuted,
    ResultShaped,
    Released,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::ParamsExtracted => "params_extracted",
            Stage::DialectAdapted => "dialect_adapted",
            Stage::ConnectionAcquired => "connection_acquired",
            Stage::CountExecuted => "count_executed",
            Stage::DataExecuted => "data_executed",
            Stage::ResultShaped => "result_shaped",
            Stage::Released => "released",
            Stage::Failed => "failed",
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Stage::Received,
            1 => Stage::Validated,
            2 => Stage::ParamsExtracted,
            3 => Stage::DialectAdapted,
            4 => Stage::ConnectionAcquired,
            5 => Stage::CountExecuted,
            6 => Stage::DataExecuted,
            7 => Stage::ResultShaped,
            8 => Stage::Released,
            _ => Stage::Failed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorized backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601, SQL Server 102/156)
    Syntax,
    /// Missing table/column, ambiguous reference, type mismatch
    Semantic,
    /// Runtime faults: division by zero, constraint violation
    Execution,
    /// Serialization failures, deadlocks, aborted transactions
    Transaction,
    /// Connection, login and pool failures
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// A fault reported by a driver or pool, classified but otherwise raw.
/// Its text stays in server logs; clients see a generic message.
#[derive(Debug, Clone, Error)]
#[error("{category}: {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    /// SQLSTATE (PostgreSQL) or error number (SQL Server)
    pub code: Option<String>,
    pub message: String,
    pub detail: Option<String>,
}

impl BackendError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: None,
            message: message.into(),
            detail: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    pub fn not_configured(target: DbTarget) -> Self {
        Self::connection(format!("{} backend is not configured", target))
    }

    pub fn from_pg(err: &tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            BackendError {
                category: categorize_sqlstate(&code),
                code: Some(code),
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
            }
        } else {
            // Non-database error (closed connection, protocol, I/O)
            let category = if err.is_closed() || err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            BackendError {
                category,
                code: None,
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
            }
        }
    }

    pub fn from_mssql(err: &tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => BackendError {
                category: categorize_mssql_number(token.code()),
                code: Some(token.code().to_string()),
                message: token.message().to_string(),
                detail: None,
            },
            tiberius::error::Error::Io { .. }
            | tiberius::error::Error::Tls(_)
            | tiberius::error::Error::Routing { .. } => Self::connection(err.to_string()),
            other => Self::new(ErrorCategory::Unknown, other.to_string()),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub(crate) fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // Class 42: syntax error or access rule violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" | "28" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Categorize a SQL Server error number.
pub(crate) fn categorize_mssql_number(number: u32) -> ErrorCategory {
    match number {
        // Incorrect syntax near ... / near keyword ...
        102 | 105 | 156 | 170 => ErrorCategory::Syntax,
        // Invalid column / object name, ambiguous column, conversion failures
        207 | 208 | 209 | 245 | 8114 => ErrorCategory::Semantic,
        // Divide by zero, constraint and null violations, arithmetic overflow
        8134 | 547 | 2601 | 2627 | 515 | 8115 => ErrorCategory::Execution,
        // Deadlock victim, lock timeout, snapshot update conflict
        1205 | 1222 | 3960 => ErrorCategory::Transaction,
        // Login failed, cannot open database
        18456 | 4060 => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Failure of one request through the query pipeline.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {message}")]
    RequestShape { message: String },

    #[error("query rejected ({severity} severity): {}", .violations.join("; "))]
    Validation {
        severity: Severity,
        violations: Vec<String>,
    },

    #[error("{target} connection unavailable: {source}")]
    Connection {
        target: DbTarget,
        #[source]
        source: BackendError,
    },

    #[error("{target} query failed at {stage}: {source}")]
    Execution {
        target: DbTarget,
        stage: Stage,
        #[source]
        source: BackendError,
    },

    #[error("query exceeded {}s timeout at {stage}", .timeout.as_secs())]
    Timeout { stage: Stage, timeout: Duration },
}

impl QueryError {
    pub fn request_shape(message: impl Into<String>) -> Self {
        QueryError::RequestShape {
            message: message.into(),
        }
    }

    /// Machine-readable kind used in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::RequestShape { .. } => "request_shape_error",
            QueryError::Validation { .. } => "validation_error",
            QueryError::Connection { .. } => "connection_error",
            QueryError::Execution { .. } => "execution_error",
            QueryError::Timeout { .. } => "timeout_error",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            QueryError::RequestShape { .. } => Stage::Received,
            QueryError::Validation { .. } => Stage::Validated,
            QueryError::Connection { .. } => Stage::ConnectionAcquired,
            QueryError::Execution { stage, .. } => *stage,
            QueryError::Timeout { stage, .. } => *stage,
        }
    }

    /// Whether a caller may retry with backoff. Nothing here retries itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Connection { .. } | QueryError::Timeout { .. }
        )
    }

    pub fn violations(&self) -> &[String] {
        match self {
            QueryError::Validation { violations, .. } => violations,
            _ => &[],
        }
    }
}

const UNTRUSTED_LOG_LIMIT: usize = 200;

/// Render client-supplied text for logs: truncated, control characters
/// escaped, wrapped in an `untrusted[...]` marker.
pub fn untrusted(text: &str) -> String {
    let mut out = String::from("untrusted[");
    for (i, ch) in text.chars().enumerate() {
        if i == UNTRUSTED_LOG_LIMIT {
            out.push_str("...");
            break;
        }
        match ch {
            ']' => out.push_str("\\]"),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.extend(c.escape_default()),
            c => out.push(c),
        }
    }
    out.push(']');
    out
}
