use serde::Serialize;

use crate::db::{CellValue, ResultRow};
use crate::error::QueryError;
use crate::executor::QueryExecutor;
use crate::sql::{DbTarget, SqlParam};

pub const MAX_PREFIX_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDiscovery {
    pub database: DbTarget,
    pub schema: String,
    pub tables: Vec<TableSchema>,
}

fn default_schema(target: DbTarget) -> &'static str {
    match target {
        DbTarget::MsSql => "dbo",
        DbTarget::Postgres => "public",
    }
}

fn columns_query(target: DbTarget) -> &'static str {
    match target {
        DbTarget::MsSql => {
            r#"SELECT c.TABLE_NAME AS table_name, c.COLUMN_NAME AS column_name,
                c.DATA_TYPE AS data_type, c.IS_NULLABLE AS is_nullable,
                c.COLUMN_DEFAULT AS column_default,
                CASE WHEN pk.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS is_primary_key
            FROM INFORMATION_SCHEMA.COLUMNS c
            LEFT JOIN (
                SELECT kcu.TABLE_NAME, kcu.COLUMN_NAME
                FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                    ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                    AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_SCHEMA = ?
            ) pk ON pk.TABLE_NAME = c.TABLE_NAME AND pk.COLUMN_NAME = c.COLUMN_NAME
            WHERE c.TABLE_SCHEMA = ?
            ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION"#
        }
        DbTarget::Postgres => {
            r#"SELECT c.table_name::text AS table_name, c.column_name::text AS column_name,
                c.data_type::text AS data_type, c.is_nullable::text AS is_nullable,
                c.column_default::text AS column_default,
                (pk.column_name IS NOT NULL) AS is_primary_key
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT kcu.table_name, kcu.column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = ?
            ) pk ON pk.table_name = c.table_name AND pk.column_name = c.column_name
            WHERE c.table_schema = ?
            ORDER BY c.table_name, c.ordinal_position"#
        }
    }
}

fn tables_query(target: DbTarget, with_prefix: bool) -> String {
    let (name, filter) = match target {
        DbTarget::MsSql => (
            "TABLE_NAME",
            "FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
        ),
        DbTarget::Postgres => (
            "table_name",
            "FROM information_schema.tables WHERE table_schema = ? AND table_type = 'BASE TABLE'",
        ),
    };
    let select = match target {
        DbTarget::MsSql => format!("SELECT {name} AS table_name"),
        DbTarget::Postgres => format!("SELECT {name}::text AS table_name"),
    };
    let prefix = if with_prefix {
        format!(" AND {name} LIKE ? ESCAPE '\\'")
    } else {
        String::new()
    };
    format!("{select} {filter}{prefix} ORDER BY {name}")
}

fn table_columns_query(target: DbTarget) -> &'static str {
    match target {
        DbTarget::MsSql => {
            "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type \
             FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION"
        }
        DbTarget::Postgres => {
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns WHERE table_schema = ? AND table_name = ? \
             ORDER BY ordinal_position"
        }
    }
}

fn text(row: &ResultRow, column: &str) -> Option<String> {
    match row.get(column)? {
        CellValue::Null => None,
        other => Some(other.display()),
    }
}

fn truthy(value: Option<&CellValue>) -> bool {
    match value {
        Some(CellValue::Bool(b)) => *b,
        Some(v) => v.as_i64().is_some_and(|n| n != 0),
        None => false,
    }
}

/// Table and column metadata for the backend's default schema.
pub async fn discover(
    executor: &QueryExecutor,
    target: DbTarget,
) -> Result<SchemaDiscovery, QueryError> {
    let schema = default_schema(target);
    let params = vec![SqlParam::from(schema), SqlParam::from(schema)];
    let rows = executor.fetch_all(target, columns_query(target), params).await?;

    let mut tables: Vec<TableSchema> = Vec::new();
    for row in &rows {
        let Some(table) = text(row, "table_name") else {
            continue;
        };
        let column = ColumnSchema {
            name: text(row, "column_name").unwrap_or_default(),
            data_type: text(row, "data_type").unwrap_or_default(),
            nullable: text(row, "is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("YES")),
            default: text(row, "column_default"),
            primary_key: truthy(row.get("is_primary_key")),
        };
        // Rows arrive ordered by table, so a new name starts a new table.
        match tables.last_mut() {
            Some(last) if last.name == table => last.columns.push(column),
            _ => tables.push(TableSchema {
                name: table,
                columns: vec![column],
            }),
        }
    }

    tracing::info!(target_db = %target, tables = tables.len(), "schema discovered");
    Ok(SchemaDiscovery {
        database: target,
        schema: schema.to_string(),
        tables,
    })
}

/// Escape LIKE wildcards so the prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

/// Two-phase summary: list tables (optionally by name prefix), then one
/// column query per table. Each entry reads `table: col (type), ...`.
pub async fn summary(
    executor: &QueryExecutor,
    target: DbTarget,
    prefix: Option<&str>,
) -> Result<Vec<String>, QueryError> {
    let prefix = prefix.map(str::trim).filter(|p| !p.is_empty());
    if let Some(p) = prefix {
        if p.chars().count() > MAX_PREFIX_LEN {
            return Err(QueryError::request_shape(format!(
                "prefix must be at most {} characters",
                MAX_PREFIX_LEN
            )));
        }
    }

    let schema = default_schema(target);
    let mut params = vec![SqlParam::from(schema)];
    if let Some(p) = prefix {
        params.push(SqlParam::Text(like_prefix(p)));
    }
    let tables = executor.fetch_all(target, &tables_query(target, prefix.is_some()), params).await?;

    let mut summaries = Vec::with_capacity(tables.len());
    for row in &tables {
        let Some(table) = text(row, "table_name") else {
            continue;
        };
        let params = vec![SqlParam::from(schema), SqlParam::Text(table.clone())];
        let columns = executor.fetch_all(target, table_columns_query(target), params).await?;
        let described: Vec<String> = columns
            .iter()
            .map(|c| {
                format!(
                    "{} ({})",
                    text(c, "column_name").unwrap_or_default(),
                    text(c, "data_type").unwrap_or_default()
                )
            })
            .collect();
        summaries.push(format!("{}: {}", table, described.join(", ")));
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::{MockProvider, MockResult};
    use crate::db::{ColumnInfo, RowSet};
    use std::sync::Arc;

    fn rows(columns: &[&str], data: Vec<Vec<CellValue>>) -> RowSet {
        RowSet::new(columns.iter().map(|c| ColumnInfo::new(*c, "text")).collect(), data)
    }

    fn t(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[tokio::test]
    async fn test_discover_groups_columns_by_table() {
        let provider = MockProvider::new().with_table(
            &[
                "table_name",
                "column_name",
                "data_type",
                "is_nullable",
                "column_default",
                "is_primary_key",
            ],
            vec![
                vec![t("parcels"), t("id"), t("integer"), t("NO"), CellValue::Null, CellValue::Bool(true)],
                vec![t("parcels"), t("owner_name"), t("text"), t("YES"), CellValue::Null, CellValue::Bool(false)],
                vec![t("sales"), t("sale_id"), t("integer"), t("NO"), t("nextval('s')"), CellValue::Bool(true)],
            ],
        );
        let executor = QueryExecutor::new(Arc::new(provider.clone()));
        let found = discover(&executor, DbTarget::Postgres).await.unwrap();

        assert_eq!(found.schema, "public");
        assert_eq!(found.tables.len(), 2);
        assert_eq!(found.tables[0].name, "parcels");
        assert_eq!(found.tables[0].columns.len(), 2);
        assert!(found.tables[0].columns[0].primary_key);
        assert!(found.tables[0].columns[1].nullable);
        assert_eq!(found.tables[1].columns[0].default.as_deref(), Some("nextval('s')"));

        let log = provider.log();
        assert_eq!(
            log.statements[1].1,
            vec![SqlParam::from("public"), SqlParam::from("public")]
        );
    }

    #[tokio::test]
    async fn test_summary_lists_tables_then_columns() {
        let provider = MockProvider::new()
            .respond(
                "COUNT(*) FROM (SELECT TABLE_NAME",
                MockResult::Rows(rows(&["count"], vec![vec![CellValue::Int32(1)]])),
            )
            .respond(
                "FROM INFORMATION_SCHEMA.TABLES",
                MockResult::Rows(rows(&["table_name"], vec![vec![t("parcels")]])),
            )
            .respond(
                "COUNT(*) FROM (SELECT COLUMN_NAME",
                MockResult::Rows(rows(&["count"], vec![vec![CellValue::Int32(2)]])),
            )
            .respond(
                "FROM INFORMATION_SCHEMA.COLUMNS",
                MockResult::Rows(rows(
                    &["column_name", "data_type"],
                    vec![vec![t("id"), t("int")], vec![t("owner_name"), t("nvarchar")]],
                )),
            );
        let executor = QueryExecutor::new(Arc::new(provider.clone()));
        let summary = summary(&executor, DbTarget::MsSql, Some("par_")).await.unwrap();
        assert_eq!(summary, vec!["parcels: id (int), owner_name (nvarchar)"]);

        let log = provider.log();
        assert_eq!(
            log.statements[0].1,
            vec![SqlParam::from("dbo"), SqlParam::from("par\\_%")]
        );
        assert!(log.sql()[1].contains("LIKE @P2 ESCAPE '\\'"));
        assert_eq!(log.statements[2].1, vec![SqlParam::from("dbo"), SqlParam::from("parcels")]);
    }

    #[tokio::test]
    async fn test_summary_rejects_long_prefix() {
        let provider = MockProvider::new();
        let executor = QueryExecutor::new(Arc::new(provider.clone()));
        let long = "p".repeat(MAX_PREFIX_LEN + 1);
        let err = summary(&executor, DbTarget::Postgres, Some(&long)).await.unwrap_err();
        assert_eq!(err.kind(), "request_shape_error");
        assert!(provider.log().acquired.is_empty());
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("parcel"), "parcel%");
        assert_eq!(like_prefix("tax_%"), "tax\\_\\%%");
    }

    #[test]
    fn test_tables_query_shapes() {
        let q = tables_query(DbTarget::Postgres, true);
        assert!(q.starts_with("SELECT table_name::text AS table_name FROM information_schema.tables"));
        assert!(q.ends_with("LIKE ? ESCAPE '\\' ORDER BY table_name"));
        assert!(!tables_query(DbTarget::MsSql, false).contains("LIKE"));
    }
}
