/// Cross-dialect rendering: placeholders, pagination clauses and count
/// wrapping for SQL Server and PostgreSQL.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{MsSqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser as SqlParser;
use std::fmt;
use thiserror::Error;

use super::params::{walk_unquoted, SqlParam, PLACEHOLDER};
use super::validator::{mask_literals_and_comments, READ_KEYWORDS};

/// The database a request is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbTarget {
    #[serde(rename = "mssql", alias = "A", alias = "MSSQL")]
    MsSql,
    #[serde(rename = "postgres", alias = "B", alias = "POSTGRES", alias = "postgresql")]
    Postgres,
}

impl DbTarget {
    pub const ALL: [DbTarget; 2] = [DbTarget::MsSql, DbTarget::Postgres];

    pub fn dialect(self) -> Dialect {
        match self {
            DbTarget::MsSql => Dialect::SqlServer,
            DbTarget::Postgres => Dialect::Postgres,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbTarget::MsSql => "mssql",
            DbTarget::Postgres => "postgres",
        }
    }
}

impl fmt::Display for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DbTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mssql" | "a" => Ok(DbTarget::MsSql),
            "postgres" | "postgresql" | "b" => Ok(DbTarget::Postgres),
            other => Err(format!("unsupported database: {}", other)),
        }
    }
}

/// SQL syntax conventions of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `@P1, @P2` placeholders; `OFFSET n ROWS FETCH NEXT m ROWS ONLY`.
    SqlServer,
    /// `$1, $2` placeholders; `LIMIT m OFFSET n`.
    Postgres,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::SqlServer => "SQL Server",
            Dialect::Postgres => "PostgreSQL",
        }
    }

    fn placeholder(self, position: usize) -> String {
        match self {
            Dialect::SqlServer => format!("@P{}", position),
            Dialect::Postgres => format!("${}", position),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query has {found} placeholders but {expected} parameters were supplied")]
pub struct PlaceholderMismatch {
    pub expected: usize,
    pub found: usize,
}

/// Render canonical `?` placeholders into the dialect's positional tokens.
///
/// One-to-one and order preserving; quoted text and comments are skipped.
pub fn to_dialect(
    dialect: Dialect,
    query: &str,
    params: &[SqlParam],
) -> Result<String, PlaceholderMismatch> {
    let mut positions = Vec::new();
    walk_unquoted(query, |pos, b| {
        if b == PLACEHOLDER as u8 {
            positions.push(pos);
        }
    });
    if positions.len() != params.len() {
        return Err(PlaceholderMismatch {
            expected: params.len(),
            found: positions.len(),
        });
    }

    let mut out = String::with_capacity(query.len() + positions.len() * 3);
    let mut last = 0;
    for (n, pos) in positions.into_iter().enumerate() {
        out.push_str(&query[last..pos]);
        out.push_str(&dialect.placeholder(n + 1));
        last = pos + 1;
    }
    out.push_str(&query[last..]);
    Ok(out)
}

static SQLSERVER_PAGED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bOFFSET\s+\S+\s+ROWS?\b|\bFETCH\s+(NEXT|FIRST)\b").expect("static pattern")
});
static SQLSERVER_TOP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\s+(DISTINCT\s+)?TOP\b").expect("static pattern"));
static POSTGRES_PAGED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(LIMIT|OFFSET)\b").expect("static pattern"));
static ORDER_BY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("static pattern"));
static ROW_LIMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(LIMIT|OFFSET|FETCH)\b").expect("static pattern"));

/// True when the outermost query already carries the dialect's
/// row-limiting clause. Clauses inside subqueries and derived tables do not
/// count.
pub fn has_pagination(dialect: Dialect, query: &str) -> bool {
    let masked = mask_literals_and_comments(query);
    match dialect {
        Dialect::SqlServer => {
            top_level_match(&masked, &SQLSERVER_PAGED_RE).is_some()
                || SQLSERVER_TOP_RE.is_match(&masked)
        }
        Dialect::Postgres => top_level_match(&masked, &POSTGRES_PAGED_RE).is_some(),
    }
}

/// Append the dialect's pagination clause to a SELECT-shaped query.
///
/// Non-SELECT statements pass through unchanged; already paginated queries
/// only lose their trailing terminator, so the call is idempotent.
pub fn paginate(dialect: Dialect, query: &str, page: u64, page_size: u64) -> String {
    let body = strip_terminator(query);
    if !is_select_shaped(dialect, body) {
        return query.to_string();
    }
    if has_pagination(dialect, body) {
        return body.to_string();
    }

    let offset = page.saturating_sub(1).saturating_mul(page_size);
    match dialect {
        Dialect::SqlServer => {
            let masked = mask_literals_and_comments(body);
            let order = if top_level_match(&masked, &ORDER_BY_RE).is_some() {
                ""
            } else {
                " ORDER BY (SELECT NULL)"
            };
            format!(
                "{}{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                body, order, offset, page_size
            )
        }
        Dialect::Postgres => format!("{} LIMIT {} OFFSET {}", body, page_size, offset),
    }
}

/// Wrap a query so it returns its total row count.
///
/// A trailing top-level ORDER BY is dropped unless a row-limiting clause
/// follows it, since SQL Server rejects ORDER BY in derived tables.
pub fn count_query(query: &str) -> String {
    let body = strip_terminator(query);
    let masked = mask_literals_and_comments(body);
    let body = match last_top_level_match(&masked, &ORDER_BY_RE) {
        Some(pos) if !ROW_LIMIT_RE.is_match(&masked[pos..]) => body[..pos].trim_end(),
        _ => body,
    };
    format!("SELECT COUNT(*) FROM ({}) AS count_subquery", body)
}

/// Whether the statement returns rows (SELECT / WITH ... SELECT / VALUES /
/// TABLE). Parsed with `sqlparser`; falls back to the leading keyword when
/// the text does not parse.
pub fn is_select_shaped(dialect: Dialect, query: &str) -> bool {
    let parsed = match dialect {
        Dialect::SqlServer => SqlParser::parse_sql(&MsSqlDialect {}, query),
        Dialect::Postgres => SqlParser::parse_sql(&PostgreSqlDialect {}, query),
    };
    match parsed {
        Ok(statements) if statements.len() == 1 => match &statements[0] {
            Statement::Query(q) => !matches!(
                *q.body,
                SetExpr::Insert(_) | SetExpr::Update(_)
            ),
            _ => false,
        },
        Ok(_) => false,
        Err(_) => {
            let masked = mask_literals_and_comments(query);
            let first = leading_keyword(&masked).to_ascii_uppercase();
            READ_KEYWORDS.contains(&first.as_str())
        }
    }
}

/// First word of the statement, skipping whitespace and opening parens.
pub fn leading_keyword(sql: &str) -> &str {
    let trimmed = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

/// Remove trailing whitespace and statement terminators.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim_end_matches(|c: char| c.is_whitespace() || c == ';')
}

fn paren_depths(masked: &str) -> Vec<i32> {
    let mut depth = 0;
    masked
        .bytes()
        .map(|b| {
            match b {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            depth
        })
        .collect()
}

fn top_level_match(masked: &str, re: &Regex) -> Option<usize> {
    let depths = paren_depths(masked);
    re.find_iter(masked)
        .map(|m| m.start())
        .find(|&pos| depths[pos] == 0)
}

fn last_top_level_match(masked: &str, re: &Regex) -> Option<usize> {
    let depths = paren_depths(masked);
    re.find_iter(masked)
        .map(|m| m.start())
        .filter(|&pos| depths[pos] == 0)
        .last()
}
