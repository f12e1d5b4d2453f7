use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeMap, Serializer};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Numeric(d) => d.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Integer view, used for COUNT(*) results whose width varies by backend.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int16(i) => Some(*i as i64),
            CellValue::Int32(i) => Some(*i as i64),
            CellValue::Int64(i) => Some(*i),
            CellValue::Numeric(d) => i64::try_from(*d).ok(),
            _ => None,
        }
    }

    /// JSON rendering used by the HTTP layer. Dates use ISO 8601; NUMERIC
    /// stays a string so no precision is lost.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int16(i) => Value::from(*i),
            CellValue::Int32(i) => Value::from(*i),
            CellValue::Int64(i) => Value::from(*i),
            CellValue::Float32(f) => serde_json::Number::from_f64(*f as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Numeric(d) => Value::String(d.to_string()),
            CellValue::Text(s) | CellValue::Unknown(s) => Value::String(s.clone()),
            CellValue::Bytes(b) => Value::String(format!("[{} bytes]", b.len())),
            CellValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            CellValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            CellValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            CellValue::TimestampTz(dt) => Value::String(dt.to_rfc3339()),
            CellValue::Json(j) => j.clone(),
            CellValue::Array(arr) => Value::Array(arr.iter().map(|v| v.to_json()).collect()),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Raw rows as returned by a backend connection, in backend column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    /// First cell of the first row, for scalar queries.
    pub fn scalar(&self) -> Option<&CellValue> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Shape raw rows into ordered column→value mappings.
    pub fn into_mappings(self) -> Vec<ResultRow> {
        let names: Vec<String> = self.columns.into_iter().map(|c| c.name).collect();
        self.rows
            .into_iter()
            .map(|values| ResultRow(names.iter().cloned().zip(values).collect()))
            .collect()
    }
}

/// One result row: column→value pairs in backend column order.
/// Serializes as a JSON object whose keys keep that order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow(pub Vec<(String, CellValue)>);

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &CellValue> {
        self.0.iter().map(|(_, v)| v)
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
