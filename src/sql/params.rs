/// Literal → bound-parameter extraction.
///
/// Turns ad-hoc SQL such as `... WHERE owner_name = 'Jane Smith'` into
/// `... WHERE owner_name = ?` plus an ordered parameter list. The scan is a
/// single left-to-right pass so parameters always bind in source order.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Canonical positional placeholder emitted by the extractor.
///
/// The dialect adapter renders it into each driver's native form.
pub const PLACEHOLDER: char = '?';

/// A typed value bound positionally to a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Null => write!(f, "NULL"),
            SqlParam::Bool(b) => write!(f, "{}", b),
            SqlParam::Integer(i) => write!(f, "{}", i),
            SqlParam::Float(x) => write!(f, "{}", x),
            SqlParam::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<i64> for SqlParam {
    fn from(i: i64) -> Self {
        SqlParam::Integer(i)
    }
}

impl From<f64> for SqlParam {
    fn from(x: f64) -> Self {
        SqlParam::Float(x)
    }
}

/// A literal lifted out of the raw text, with its byte span in that text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedParameter {
    pub value: SqlParam,
    pub span: Range<usize>,
}

/// Result of [`extract`]: rewritten text plus parameters in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub text: String,
    pub params: Vec<ExtractedParameter>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter values in binding order.
    pub fn values(&self) -> Vec<SqlParam> {
        self.params.iter().map(|p| p.value.clone()).collect()
    }
}

/// Keywords that open the filtered region where bare numbers are lifted.
const FILTER_KEYWORDS: [&str; 3] = ["WHERE", "HAVING", "ON"];

/// Extract string literals (anywhere) and numeric comparison operands (from
/// the first WHERE/HAVING/ON onward) into positional parameters.
///
/// Comments are dropped from the rewritten text. When nothing is extracted
/// the original text is returned untouched. Escaped quotes inside literals
/// are not recognised; `'O''Brien'` yields two literals.
pub fn extract(raw: &str) -> Extraction {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut params = Vec::new();
    let mut in_filter = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        // Line comment
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            let end = raw[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len());
            i = end;
            continue;
        }

        // Block comment
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            match raw[i + 2..].find("*/") {
                Some(p) => {
                    out.push(' ');
                    i = i + 2 + p + 2;
                }
                None => {
                    // Unterminated: keep the rest verbatim
                    out.push_str(&raw[i..]);
                    i = bytes.len();
                }
            }
            continue;
        }

        // Quoted literal
        if b == b'\'' || b == b'"' {
            match raw[i + 1..].find(b as char) {
                Some(p) => {
                    let end = i + 1 + p;
                    params.push(ExtractedParameter {
                        value: SqlParam::Text(raw[i + 1..end].to_string()),
                        span: i..end + 1,
                    });
                    out.push(PLACEHOLDER);
                    i = end + 1;
                }
                None => {
                    out.push_str(&raw[i..]);
                    i = bytes.len();
                }
            }
            continue;
        }

        // Identifiers and keywords
        if is_ident_start(b) {
            let end = scan_ident(bytes, i);
            let word = &raw[i..end];
            if !in_filter && FILTER_KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k)) {
                in_filter = true;
            }
            out.push_str(word);
            i = end;
            continue;
        }

        // Comparison operator followed by a numeric operand
        if in_filter {
            if let Some(op_len) = comparison_operator_len(bytes, i) {
                let op_end = i + op_len;
                let num_start = skip_spaces(bytes, op_end);
                if let Some((num_end, value)) = numeric_operand(raw, num_start) {
                    out.push_str(&raw[i..num_start]);
                    out.push(PLACEHOLDER);
                    params.push(ExtractedParameter {
                        value,
                        span: num_start..num_end,
                    });
                    i = num_end;
                    continue;
                }
                out.push_str(&raw[i..op_end]);
                i = op_end;
                continue;
            }
        }

        // Copy one character (may be multi-byte)
        let ch_len = raw[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&raw[i..i + ch_len]);
        i += ch_len;
    }

    if params.is_empty() {
        return Extraction {
            text: raw.to_string(),
            params,
        };
    }

    Extraction { text: out, params }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'#' || b == b'@'
}

fn scan_ident(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    end
}

fn skip_spaces(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Length of the comparison operator at `pos`: `=`, `>`, `<`, `>=`, `<=`,
/// `!=`, `<>`.
fn comparison_operator_len(bytes: &[u8], pos: usize) -> Option<usize> {
    let next = bytes.get(pos + 1).copied();
    match bytes[pos] {
        b'=' => Some(1),
        b'!' if next == Some(b'=') => Some(2),
        b'<' if next == Some(b'=') || next == Some(b'>') => Some(2),
        b'>' if next == Some(b'=') => Some(2),
        b'<' | b'>' => Some(1),
        _ => None,
    }
}

/// Parse `-?digits(.digits)?` at `start`. Rejects operands glued to an
/// identifier (`= 3abc`) or followed by `(`.
fn numeric_operand(raw: &str, start: usize) -> Option<(usize, SqlParam)> {
    let bytes = raw.as_bytes();
    let mut pos = start;
    if bytes.get(pos) == Some(&b'-') {
        pos += 1;
    }
    let digits_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == digits_start {
        return None;
    }
    let mut is_float = false;
    if bytes.get(pos) == Some(&b'.') && bytes.get(pos + 1).is_some_and(|b| b.is_ascii_digit()) {
        is_float = true;
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if bytes.get(pos).is_some_and(|&b| is_ident_char(b) || b == b'.') {
        return None;
    }
    if bytes.get(skip_spaces(bytes, pos)) == Some(&b'(') {
        return None;
    }

    let literal = &raw[start..pos];
    let value = if is_float {
        SqlParam::Float(literal.parse().ok()?)
    } else {
        SqlParam::Integer(literal.parse().ok()?)
    };
    Some((pos, value))
}

/// Count canonical placeholders outside quoted text and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    walk_unquoted(sql, |_, b| {
        if b == PLACEHOLDER as u8 {
            count += 1;
        }
    });
    count
}

/// Visit every byte of `sql` that sits outside quotes and comments.
pub(crate) fn walk_unquoted(sql: &str, mut visit: impl FnMut(usize, u8)) {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = sql[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len());
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = sql[i + 2..].find("*/").map(|p| i + 2 + p + 2).unwrap_or(bytes.len());
            continue;
        }
        if b == b'\'' || b == b'"' {
            i = sql[i + 1..].find(b as char).map(|p| i + 1 + p + 1).unwrap_or(bytes.len());
            continue;
        }
        visit(i, b);
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameterless_query_is_untouched() {
        let e = extract("SELECT * FROM t");
        assert_eq!(e.text, "SELECT * FROM t");
        assert!(e.params.is_empty());
    }

    #[test]
    fn test_owner_name_literal() {
        let e = extract("SELECT * FROM parcels WHERE owner_name = 'Jane Smith'");
        assert_eq!(e.text, "SELECT * FROM parcels WHERE owner_name = ?");
        assert_eq!(e.values(), vec![SqlParam::Text("Jane Smith".into())]);
    }

    #[test]
    fn test_numeric_after_where() {
        let e = extract("SELECT id, name FROM parcels WHERE total_value > 500000");
        assert_eq!(e.text, "SELECT id, name FROM parcels WHERE total_value > ?");
        assert_eq!(e.values(), vec![SqlParam::Integer(500000)]);
    }

    #[test]
    fn test_float_and_int_detection() {
        let e = extract("SELECT * FROM sales WHERE sale_price >= 1250.50 AND bedrooms <> 3");
        assert_eq!(
            e.values(),
            vec![SqlParam::Float(1250.50), SqlParam::Integer(3)]
        );
        assert_eq!(
            e.text,
            "SELECT * FROM sales WHERE sale_price >= ? AND bedrooms <> ?"
        );
    }

    #[test]
    fn test_numbers_before_filter_region_are_kept() {
        let e = extract("SELECT TOP 10 id FROM parcels");
        assert!(e.params.is_empty());

        let e = extract("SELECT a = 1 FROM t WHERE b = 2");
        assert_eq!(e.values(), vec![SqlParam::Integer(2)]);
        assert_eq!(e.text, "SELECT a = 1 FROM t WHERE b = ?");
    }

    #[test]
    fn test_limit_and_function_arguments_not_extracted() {
        let e = extract("SELECT * FROM parcels WHERE id > 5 ORDER BY id LIMIT 20");
        assert_eq!(e.values(), vec![SqlParam::Integer(5)]);
        assert!(e.text.ends_with("LIMIT 20"));

        let e = extract("SELECT * FROM t WHERE round(x, 2) = 4 (");
        assert!(e.params.is_empty());
    }

    #[test]
    fn test_mixed_order_is_preserved() {
        let sql = "SELECT * FROM p JOIN s ON p.id = s.parcel_id \
                   WHERE p.city = 'Richland' AND s.sale_price > 100000 AND p.state = \"WA\"";
        let e = extract(sql);
        assert_eq!(
            e.values(),
            vec![
                SqlParam::Text("Richland".into()),
                SqlParam::Integer(100000),
                SqlParam::Text("WA".into()),
            ]
        );
        assert_eq!(count_placeholders(&e.text), e.params.len());
    }

    #[test]
    fn test_spans_point_into_raw_text() {
        let sql = "SELECT * FROM t WHERE a = 'x' AND b = 42";
        let e = extract(sql);
        assert_eq!(&sql[e.params[0].span.clone()], "'x'");
        assert_eq!(&sql[e.params[1].span.clone()], "42");
    }

    #[test]
    fn test_comments_are_stripped() {
        let sql = "SELECT * FROM t -- where x = 'hidden'\nWHERE /* y = 9 */ z = 'v'";
        let e = extract(sql);
        assert_eq!(e.values(), vec![SqlParam::Text("v".into())]);
        assert!(!e.text.contains("hidden"));
        assert!(!e.text.contains("y = 9"));
    }

    #[test]
    fn test_negative_numbers() {
        let e = extract("SELECT * FROM t WHERE delta < -15");
        assert_eq!(e.values(), vec![SqlParam::Integer(-15)]);
    }

    #[test]
    fn test_unterminated_literal_is_left_alone() {
        let e = extract("SELECT * FROM t WHERE name = 'oops");
        assert!(e.params.is_empty());
        assert_eq!(e.text, "SELECT * FROM t WHERE name = 'oops");
    }

    #[test]
    fn test_count_placeholders_ignores_quoted() {
        assert_eq!(count_placeholders("SELECT '?' FROM t WHERE a = ?"), 1);
        assert_eq!(count_placeholders("SELECT 1 -- ?\n"), 0);
    }

    #[test]
    fn test_sql_param_untagged_json() {
        let params: Vec<SqlParam> = serde_json::from_str(r#"["a", 1, 2.5, true, null]"#).unwrap();
        assert_eq!(
            params,
            vec![
                SqlParam::Text("a".into()),
                SqlParam::Integer(1),
                SqlParam::Float(2.5),
                SqlParam::Bool(true),
                SqlParam::Null,
            ]
        );
    }
}
