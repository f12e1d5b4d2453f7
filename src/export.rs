use serde::Deserialize;

use crate::db::CellValue;
use crate::executor::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Tsv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Tsv => "text/tab-separated-values; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Json => "json",
        }
    }

    pub fn render(self, result: &QueryResult) -> String {
        match self {
            ExportFormat::Csv => to_csv(result),
            ExportFormat::Tsv => to_tsv(result),
            ExportFormat::Json => to_json(result),
        }
    }
}

pub fn to_csv(result: &QueryResult) -> String {
    let mut output = String::new();

    let headers: Vec<String> = result.columns.iter().map(|c| csv_escape(&c.name)).collect();
    output.push_str(&headers.join(","));
    output.push_str("\r\n");

    for row in &result.rows {
        let cells: Vec<String> = row
            .values()
            .map(|cell| csv_escape(&cell_text(cell)))
            .collect();
        output.push_str(&cells.join(","));
        output.push_str("\r\n");
    }

    output
}

/// Tabs and line breaks inside values become spaces.
pub fn to_tsv(result: &QueryResult) -> String {
    let mut output = String::new();

    let headers: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    output.push_str(&headers.join("\t"));
    output.push('\n');

    for row in &result.rows {
        let cells: Vec<String> = row
            .values()
            .map(|cell| cell_text(cell).replace(['\t', '\n', '\r'], " "))
            .collect();
        output.push_str(&cells.join("\t"));
        output.push('\n');
    }

    output
}

pub fn to_json(result: &QueryResult) -> String {
    serde_json::to_string_pretty(&result.rows).unwrap_or_else(|_| "[]".to_string())
}

fn cell_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        other => other.display(),
    }
}

/// RFC 4180 quoting.
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnInfo, RowSet};
    use crate::sql::compute_pagination;
    use std::time::Duration;

    fn make_result() -> QueryResult {
        let set = RowSet::new(
            vec![
                ColumnInfo::new("parcel_id", "int4"),
                ColumnInfo::new("address", "text"),
                ColumnInfo::new("land_use", "text"),
            ],
            vec![
                vec![
                    CellValue::Int32(101),
                    CellValue::Text("12 Elm St, Unit 4".into()),
                    CellValue::Text("residential".into()),
                ],
                vec![
                    CellValue::Int32(102),
                    CellValue::Text("the \"Old Mill\"".into()),
                    CellValue::Null,
                ],
            ],
        );
        QueryResult {
            columns: set.columns.clone(),
            rows: set.into_mappings(),
            pagination: compute_pagination(1, 50, 2),
            total_count: 2,
            corrections: vec![],
            execution_time: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_csv_quotes_per_rfc4180() {
        let csv = to_csv(&make_result());
        let lines: Vec<&str> = csv.split("\r\n").collect();
        assert_eq!(lines[0], "parcel_id,address,land_use");
        assert_eq!(lines[1], "101,\"12 Elm St, Unit 4\",residential");
        assert_eq!(lines[2], "102,\"the \"\"Old Mill\"\"\",");
    }

    #[test]
    fn test_tsv_flattens_separators() {
        let mut result = make_result();
        result.rows[0].0[1].1 = CellValue::Text("a\tb\nc".into());
        let tsv = to_tsv(&result);
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "parcel_id\taddress\tland_use");
        assert_eq!(lines[1], "101\ta b c\tresidential");
    }

    #[test]
    fn test_json_keeps_column_order_and_nulls() {
        let json = to_json(&make_result());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["parcel_id"], 101);
        assert!(parsed[1]["land_use"].is_null());
        assert!(json.find("parcel_id").unwrap() < json.find("address").unwrap());
    }

    #[test]
    fn test_empty_result_has_header_only() {
        let mut result = make_result();
        result.rows.clear();
        assert_eq!(to_csv(&result), "parcel_id,address,land_use\r\n");
        assert_eq!(to_json(&result), "[]");
    }

    #[test]
    fn test_format_metadata() {
        let f: ExportFormat = serde_json::from_str("\"tsv\"").unwrap();
        assert_eq!(f, ExportFormat::Tsv);
        assert_eq!(f.extension(), "tsv");
        assert_eq!(ExportFormat::Json.content_type(), "application/json");
        assert_eq!(ExportFormat::default(), ExportFormat::Csv);
    }
}
