//! Natural-language to SQL translation.
//!
//! Translation is an oracle: it returns text, never runs it. Whatever comes
//! back still goes through the query validator when a client submits it to
//! `/run-query`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sql::{DbTarget, Severity, ValidationVerdict, Violation};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

const FALLBACK_ROW_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub sql: String,
    pub explanation: String,
}

#[async_trait]
pub trait SqlTranslator: Send + Sync {
    async fn translate(
        &self,
        prompt: &str,
        target: DbTarget,
        schema_info: &str,
    ) -> Result<Translation>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Prompt validation
// ---------------------------------------------------------------------------

static MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<script|<iframe|<img|<a\s+").expect("static pattern"));

static LOOKS_LIKE_SQL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\s+|\bFROM\b|\bWHERE\b").expect("static pattern"));

static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(DROP|DELETE|UPDATE|INSERT|ALTER)\b.*\b(TABLE|DATABASE|SCHEMA|VIEW|INDEX|USER)\b",
        r"(?i);\s*\b(DROP|DELETE|UPDATE|INSERT|ALTER)\b",
        r"--",
        r"(?s)/\*.*\*/",
        r"(?i)\bUNION\b.+\bSELECT\b",
        r"(?i)\bEXEC\b.+\bsp_\w+\b",
        r"(?i)\bXP_\w+\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Screen a prompt before it reaches a translator. Low-severity findings
/// (too short, reads like SQL) are reported but accepted.
pub fn validate_prompt(prompt: &str) -> ValidationVerdict {
    let mut violations = Vec::new();
    let mut flag = |reason: &str, severity| {
        violations.push(Violation {
            reason: reason.to_string(),
            severity,
        })
    };

    if prompt.trim().chars().count() < 5 {
        flag("Prompt is too short", Severity::Low);
    }
    if MARKUP.is_match(prompt) {
        flag("Potential HTML/JavaScript injection detected", Severity::High);
    }
    if INJECTION_PATTERNS.iter().any(|re| re.is_match(prompt)) {
        flag("SQL patterns detected in natural language prompt", Severity::Medium);
    }
    if LOOKS_LIKE_SQL.is_match(prompt) {
        flag(
            "Prompt appears to be a SQL query instead of natural language",
            Severity::Low,
        );
    }

    ValidationVerdict::from_violations(violations)
}

/// Table descriptions handed to a translator as context.
pub fn schema_context(target: DbTarget) -> String {
    format!(
        "Schema for the {} property-assessment database.\n\
         Tables:\n\
         - parcels: id, parcel_id, address, city, state, zip_code, land_value, \
         improvement_value, total_value, assessment_year, latitude, longitude\n\
         - properties: id, parcel_id, property_type, year_built, square_footage, bedrooms, \
         bathrooms, lot_size, lot_size_unit, stories, condition, quality, tax_district, zoning\n\
         - sales: id, parcel_id, sale_date, sale_price, sale_type, transaction_id, buyer_name, \
         seller_name, financing_type\n\
         Relationships:\n\
         - properties.parcel_id references parcels.id\n\
         - sales.parcel_id references parcels.id",
        target.dialect().name()
    )
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiTranslator {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiTranslator {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let base_url: String = base_url.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn system_message(target: DbTarget, schema_info: &str) -> String {
        let dialect = target.dialect().name();
        format!(
            "You are an expert SQL translator for {dialect} databases.\n\
             Translate natural language queries to SQL based on the following schema:\n\n\
             {schema_info}\n\n\
             Guidelines:\n\
             - Generate ONLY {dialect} SQL syntax\n\
             - Generate a single read-only SELECT statement\n\
             - Include appropriate JOINs when needed\n\
             - Use proper column and table names from the schema\n\
             - Provide a brief explanation of the query\n\n\
             Respond with a JSON object: {{\"sql\": \"...\", \"explanation\": \"...\"}}"
        )
    }
}

#[async_trait]
impl SqlTranslator for OpenAiTranslator {
    async fn translate(
        &self,
        prompt: &str,
        target: DbTarget,
        schema_info: &str,
    ) -> Result<Translation> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = CompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_message(target, schema_info),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Translate this to SQL: {}", prompt),
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.1,
            max_tokens: 500,
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Translation request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Translation service returned {}: {}", status, text);
        }

        let response: CompletionResponse = resp
            .json()
            .await
            .context("Malformed translation response")?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Translation response had no content")?;
        let translation: Translation =
            serde_json::from_str(&content).context("Translation content was not {sql, explanation}")?;
        if translation.sql.trim().is_empty() {
            bail!("Translation service returned empty SQL");
        }

        tracing::info!(target_db = %target, model = %self.model, "prompt translated");
        Ok(translation)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Offline keyword translation
// ---------------------------------------------------------------------------

/// Maps words in the prompt onto the parcels/properties/sales tables. Good
/// enough to hand the user a starting query when no model is reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordTranslator;

impl KeywordTranslator {
    pub fn build(&self, prompt: &str, target: DbTarget) -> Translation {
        let lower = prompt.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        let mut tables = Vec::new();
        if mentions(&["parcel", "address"]) {
            tables.push("parcels");
        }
        if mentions(&["propert", "house", "building"]) {
            tables.push("properties");
        }
        if mentions(&["sale", "sold", "transaction"]) {
            tables.push("sales");
        }

        let mut conditions = Vec::new();
        if lower.contains("city") {
            conditions.push("city LIKE '%City%'".to_string());
        }
        if lower.contains("state") {
            conditions.push("state = 'State'".to_string());
        }
        if mentions(&["price", "value"]) {
            conditions.push("total_value > 0".to_string());
        }
        if mentions(&["recent", "latest"]) && tables.contains(&"sales") {
            conditions.push(match target {
                DbTarget::Postgres => "sale_date >= CURRENT_DATE - INTERVAL '1 year'".to_string(),
                DbTarget::MsSql => "sale_date >= DATEADD(year, -1, CAST(GETDATE() AS date))".to_string(),
            });
        }

        let (from, explanation) = match tables.as_slice() {
            [] => (
                "parcels".to_string(),
                format!("Fallback query to retrieve all parcels with a limit of {}.", FALLBACK_ROW_LIMIT),
            ),
            [only] => (
                only.to_string(),
                format!("Basic query to retrieve data from {} table with filtering.", only),
            ),
            [primary, rest @ ..] => {
                let mut from = primary.to_string();
                // parcels is always listed first when mentioned.
                if *primary == "parcels" {
                    for joined in rest {
                        from.push_str(&format!(
                            " LEFT JOIN {joined} ON parcels.id = {joined}.parcel_id"
                        ));
                    }
                }
                (
                    from,
                    format!("Basic query joining {} tables with filtering.", tables.join(", ")),
                )
            }
        };

        let where_clause = if tables.is_empty() || conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = match target {
            DbTarget::Postgres => {
                format!("SELECT * FROM {}{} LIMIT {}", from, where_clause, FALLBACK_ROW_LIMIT)
            }
            DbTarget::MsSql => {
                format!("SELECT TOP {} * FROM {}{}", FALLBACK_ROW_LIMIT, from, where_clause)
            }
        };

        Translation {
            sql,
            explanation: format!(
                "{} (This is a fallback query as the AI translation service is unavailable)",
                explanation
            ),
        }
    }
}

#[async_trait]
impl SqlTranslator for KeywordTranslator {
    async fn translate(&self, prompt: &str, target: DbTarget, _schema_info: &str) -> Result<Translation> {
        Ok(self.build(prompt, target))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

/// Tries `primary`, answering from the keyword translator on any failure.
pub struct FallbackTranslator {
    primary: Option<Box<dyn SqlTranslator>>,
    fallback: KeywordTranslator,
}

impl FallbackTranslator {
    pub fn new(primary: Option<Box<dyn SqlTranslator>>) -> Self {
        Self {
            primary,
            fallback: KeywordTranslator,
        }
    }

    pub fn offline() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SqlTranslator for FallbackTranslator {
    async fn translate(
        &self,
        prompt: &str,
        target: DbTarget,
        schema_info: &str,
    ) -> Result<Translation> {
        if let Some(primary) = &self.primary {
            match primary.translate(prompt, target, schema_info).await {
                Ok(translation) => return Ok(translation),
                Err(e) => {
                    tracing::warn!(translator = primary.name(), error = %e, "translation failed, using keyword fallback");
                }
            }
        }
        self.fallback.translate(prompt, target, schema_info).await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}
