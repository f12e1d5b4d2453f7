/// Read-only SQL policy check.
///
/// The validator never fails: every input yields a [`ValidationVerdict`].
/// Keyword scans run over a masked copy of the text in which quoted literals
/// and comments are blanked, so `owner_name = 'Drop Zone LLC'` is not a hit.
/// Quote and comment balance is checked on the raw text.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use super::dialect::leading_keyword;

/// Ordinal ranking of a violation: `None < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationVerdict {
    pub is_safe: bool,
    pub severity: Severity,
    pub violations: Vec<Violation>,
}

impl ValidationVerdict {
    pub(crate) fn from_violations(violations: Vec<Violation>) -> Self {
        let severity = violations
            .iter()
            .map(|v| v.severity)
            .max()
            .unwrap_or_default();
        Self {
            is_safe: severity < Severity::Medium,
            severity,
            violations,
        }
    }

    pub fn reasons(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.reason.as_str()).collect()
    }
}

/// Statement-altering keywords permitted only on the trusted write path.
const WRITE_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "CREATE",
];

/// Keywords that are never accepted, whatever the caller.
const PRIVILEGED_KEYWORDS: &[&str] = &[
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "SHUTDOWN", "KILL",
];

/// Data-exfiltration shapes, always rejected.
const EXFILTRATION_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\bINTO\s+(OUT|DUMP)FILE\b", "file export (INTO OUTFILE)"),
    (r"(?i)\bLOAD\s+DATA\b", "bulk file load (LOAD DATA)"),
    (r"(?i)\bUNION\s+(ALL\s+)?SELECT\b", "UNION SELECT"),
    (r"(?i)\bUNION\s+ALL\b", "UNION ALL"),
];

/// Server internals and host-reaching functions, always rejected.
const SYSTEM_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\bsys\s*\.", "system schema sys"),
    (r"(?i)\bmaster\s*\.", "system database master"),
    (r"(?i)\bmsdb\s*\.", "system database msdb"),
    (r"(?i)\bpg_catalog\s*\.", "system schema pg_catalog"),
    (r"(?i)\bxp_\w+", "extended procedure xp_*"),
    (r"(?i)\bsp_execute(sql)?\b", "dynamic SQL procedure"),
    (r"(?i)\bopen(rowset|datasource|query)\s*\(", "remote data source"),
    (r"(?i)\bpg_(read_file|read_binary_file|ls_dir|stat_file)\s*\(", "server file access"),
    (r"(?i)\bpg_sleep(_for|_until)?\s*\(", "pg_sleep"),
    (r"(?i)\bpg_(terminate|cancel)_backend\s*\(", "backend signalling"),
    (r"(?i)\bload_file\s*\(", "load_file"),
    (r"(?i)\bbenchmark\s*\(", "benchmark"),
    (r"(?i)\bwaitfor\s+(delay|time)\b", "WAITFOR"),
    (r"(?i)\bdblink\w*\s*\(", "dblink"),
];

/// Standard metadata views: allowed, but reported.
const CATALOG_PATTERNS: &[&str] = &[r"(?i)\binformation_schema\s*\."];

fn keyword_regex(words: &[&str]) -> Regex {
    let alternation = words.join("|");
    Regex::new(&format!(r"(?i)\b({})\b", alternation)).expect("static keyword table")
}

static WRITE_RE: Lazy<Regex> = Lazy::new(|| keyword_regex(WRITE_KEYWORDS));
static PRIVILEGED_RE: Lazy<Regex> = Lazy::new(|| keyword_regex(PRIVILEGED_KEYWORDS));
static EXFILTRATION_RE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    EXFILTRATION_PATTERNS
        .iter()
        .map(|(p, label)| (Regex::new(p).expect("static pattern table"), *label))
        .collect()
});
static SYSTEM_RE: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    SYSTEM_PATTERNS
        .iter()
        .map(|(p, label)| (Regex::new(p).expect("static pattern table"), *label))
        .collect()
});
static CATALOG_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    CATALOG_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("static pattern table"))
        .collect()
});

/// Leading keywords that make a statement SELECT-shaped.
pub const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "TABLE"];

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryValidator {
    allow_write: bool,
}

impl QueryValidator {
    /// The policy applied to every external request.
    pub fn read_only() -> Self {
        Self { allow_write: false }
    }

    /// Policy for internal, separately authorised write callers.
    pub fn trusted_writer() -> Self {
        Self { allow_write: true }
    }

    pub fn allows_write(&self) -> bool {
        self.allow_write
    }

    pub fn validate(&self, raw: &str) -> ValidationVerdict {
        let mut violations = Vec::new();
        if raw.trim().is_empty() {
            return ValidationVerdict::from_violations(violations);
        }

        let masked = mask_literals_and_comments(raw);

        if has_stacked_statement(&masked) {
            violations.push(Violation {
                reason: "multiple SQL statements detected".to_string(),
                severity: Severity::High,
            });
        }

        if !self.allow_write {
            let mut seen = Vec::new();
            for m in WRITE_RE.find_iter(&masked) {
                let kw = m.as_str().to_ascii_uppercase();
                if !seen.contains(&kw) {
                    violations.push(Violation {
                        reason: format!("write keyword {} is not allowed in read-only mode", kw),
                        severity: Severity::High,
                    });
                    seen.push(kw);
                }
            }

            let first = leading_keyword(&masked).to_ascii_uppercase();
            if !READ_KEYWORDS.contains(&first.as_str()) && !seen.contains(&first) {
                violations.push(Violation {
                    reason: "only SELECT queries are allowed in read-only mode".to_string(),
                    severity: Severity::High,
                });
            }
        }

        let mut seen = Vec::new();
        for m in PRIVILEGED_RE.find_iter(&masked) {
            let kw = m.as_str().to_ascii_uppercase();
            if !seen.contains(&kw) {
                violations.push(Violation {
                    reason: format!("privileged keyword {} is never allowed", kw),
                    severity: Severity::High,
                });
                seen.push(kw);
            }
        }

        for (re, label) in EXFILTRATION_RE.iter() {
            if re.is_match(&masked) {
                violations.push(Violation {
                    reason: format!("data exfiltration pattern: {}", label),
                    severity: Severity::High,
                });
            }
        }

        for (re, label) in SYSTEM_RE.iter() {
            if re.is_match(&masked) {
                violations.push(Violation {
                    reason: format!("system object access: {}", label),
                    severity: Severity::High,
                });
            }
        }

        if raw.matches('\'').count() % 2 != 0 {
            violations.push(Violation {
                reason: "unbalanced single quotes".to_string(),
                severity: Severity::Medium,
            });
        }
        if raw.matches('"').count() % 2 != 0 {
            violations.push(Violation {
                reason: "unbalanced double quotes".to_string(),
                severity: Severity::Medium,
            });
        }
        if raw.matches("/*").count() != raw.matches("*/").count() {
            violations.push(Violation {
                reason: "unbalanced comment blocks".to_string(),
                severity: Severity::Medium,
            });
        }

        if CATALOG_RE.iter().any(|re| re.is_match(&masked)) {
            violations.push(Violation {
                reason: "query references information_schema views".to_string(),
                severity: Severity::Low,
            });
        }

        ValidationVerdict::from_violations(violations)
    }
}

/// Blank out quoted literal bodies and comments, keeping byte offsets.
/// An unterminated literal or comment blanks the remainder of the text.
pub(crate) fn mask_literals_and_comments(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let end = if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            raw[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len())
        } else if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            raw[i + 2..].find("*/").map(|p| i + 2 + p + 2).unwrap_or(bytes.len())
        } else if b == b'\'' || b == b'"' {
            raw[i + 1..].find(b as char).map(|p| i + 1 + p + 1).unwrap_or(bytes.len())
        } else {
            out.push(b);
            i += 1;
            continue;
        };
        out.extend(std::iter::repeat(b' ').take(end - i));
        i = end;
    }
    // Only ASCII bytes were replaced, and whole literals at that.
    String::from_utf8(out).unwrap_or_default()
}

/// A `;` followed by anything other than whitespace or further `;`.
fn has_stacked_statement(masked: &str) -> bool {
    match masked.find(';') {
        Some(pos) => masked[pos..].chars().any(|c| !c.is_whitespace() && c != ';'),
        None => false,
    }
}
