use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::{PgTlsSettings, PoolSettings};
use crate::nl::{DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL};
use crate::sql::PaginationPolicy;

/// Keys shorter than this never authenticate anything.
pub const MIN_API_KEY_LEN: usize = 8;

/// Runtime settings. Layered as defaults, then the TOML file, then
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// ADO.NET style SQL Server connection string.
    pub mssql_conn_str: Option<String>,
    /// PostgreSQL URL or key/value connection string.
    pub postgres_url: Option<String>,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_accept_invalid_certs: bool,

    pub min_page_size: u64,
    pub max_page_size: u64,
    pub default_page_size: u64,
    pub query_timeout_secs: u64,
    pub pool_max_size: usize,
    pub pool_timeout_secs: u64,

    pub api_key: Option<String>,
    pub api_key_header: String,
    pub allowed_origins: Vec<String>,
    pub allow_write_path: bool,

    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            mssql_conn_str: None,
            postgres_url: None,
            pg_ssl_root_cert: None,
            pg_accept_invalid_certs: false,
            min_page_size: 1,
            max_page_size: 500,
            default_page_size: 50,
            query_timeout_secs: 30,
            pool_max_size: 10,
            pool_timeout_secs: 5,
            api_key: None,
            api_key_header: "x-api-key".to_string(),
            allowed_origins: vec!["http://localhost:5000".to_string()],
            allow_write_path: false,
            openai_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
        }
    }
}

impl Settings {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("assessor-api")
            .join("config.toml")
    }

    /// Load settings from `path` (or the default config file when it
    /// exists), then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.with_overrides(|key| std::env::var(key).ok())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ASSESSOR_HOST") {
            self.host = v;
        }
        if let Some(v) = get("ASSESSOR_PORT") {
            self.port = parse_num("ASSESSOR_PORT", &v)?;
        }

        if let Some(v) = get("MSSQL_CONN_STR") {
            self.mssql_conn_str = Some(v);
        }
        if let Some(v) = get("DATABASE_URL") {
            self.postgres_url = Some(v);
        } else if let Some(conn) = compose_pg_conn_str(&get) {
            self.postgres_url = Some(conn);
        }
        if let Some(v) = get("PGSSLROOTCERT") {
            self.pg_ssl_root_cert = Some(v);
        }
        if let Some(v) = get("PG_ACCEPT_INVALID_CERTS") {
            self.pg_accept_invalid_certs = parse_bool(&v);
        }

        if let Some(v) = get("MIN_PAGE_SIZE") {
            self.min_page_size = parse_num("MIN_PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_PAGE_SIZE") {
            self.max_page_size = parse_num("MAX_PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("DEFAULT_PAGE_SIZE") {
            self.default_page_size = parse_num("DEFAULT_PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = parse_num("QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("POOL_MAX_SIZE") {
            self.pool_max_size = parse_num("POOL_MAX_SIZE", &v)?;
        }
        if let Some(v) = get("POOL_TIMEOUT_SECS") {
            self.pool_timeout_secs = parse_num("POOL_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("MCP_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = get("API_KEY_HEADER_NAME") {
            self.api_key_header = v.to_lowercase();
        }
        if let Some(v) = get("ALLOWED_ORIGINS") {
            let origins: Vec<String> = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                self.allowed_origins = origins;
            }
        }
        if let Some(v) = get("ALLOW_WRITE_PATH") {
            self.allow_write_path = parse_bool(&v);
        }

        if let Some(v) = get("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.openai_model = v;
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.openai_base_url = v;
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.min_page_size == 0 {
            anyhow::bail!("MIN_PAGE_SIZE must be at least 1");
        }
        if self.min_page_size > self.max_page_size {
            anyhow::bail!(
                "MIN_PAGE_SIZE ({}) exceeds MAX_PAGE_SIZE ({})",
                self.min_page_size,
                self.max_page_size
            );
        }
        if !(self.min_page_size..=self.max_page_size).contains(&self.default_page_size) {
            anyhow::bail!(
                "DEFAULT_PAGE_SIZE ({}) must lie within {}..={}",
                self.default_page_size,
                self.min_page_size,
                self.max_page_size
            );
        }
        if self.pool_max_size == 0 {
            anyhow::bail!("POOL_MAX_SIZE must be at least 1");
        }
        Ok(())
    }

    /// The configured API key, if it is long enough to be usable.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .filter(|k| k.chars().count() >= MIN_API_KEY_LEN)
    }

    pub fn policy(&self) -> PaginationPolicy {
        PaginationPolicy {
            min_page_size: self.min_page_size,
            max_page_size: self.max_page_size,
            default_page_size: self.default_page_size,
        }
    }

    pub fn pool(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_max_size,
            wait_timeout: Duration::from_secs(self.pool_timeout_secs),
        }
    }

    pub fn postgres_tls(&self) -> PgTlsSettings {
        PgTlsSettings {
            ca_cert_path: self.pg_ssl_root_cert.clone(),
            accept_invalid_certs: self.pg_accept_invalid_certs,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Build a key/value connection string from the libpq variables. Only
/// done when at least one of them is set.
fn compose_pg_conn_str(get: &impl Fn(&str) -> Option<String>) -> Option<String> {
    const VARS: [(&str, &str, &str); 5] = [
        ("PGHOST", "host", "localhost"),
        ("PGPORT", "port", "5432"),
        ("PGUSER", "user", "postgres"),
        ("PGPASSWORD", "password", ""),
        ("PGDATABASE", "dbname", "postgres"),
    ];

    if VARS.iter().all(|(var, _, _)| get(var).is_none()) {
        return None;
    }

    let parts: Vec<String> = VARS
        .iter()
        .filter_map(|(var, key, default)| {
            let value = get(var).unwrap_or_else(|| default.to_string());
            if value.is_empty() {
                None
            } else {
                Some(format!("{}='{}'", key, value.replace('\\', "\\\\").replace('\'', "\\'")))
            }
        })
        .collect();
    Some(parts.join(" "))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default().with_overrides(env(&[])).unwrap();
        assert_eq!(s.policy(), PaginationPolicy::default());
        assert_eq!(s.query_timeout(), Duration::from_secs(30));
        assert_eq!(s.api_key_header, "x-api-key");
        assert_eq!(s.allowed_origins, vec!["http://localhost:5000"]);
        assert!(s.postgres_url.is_none());
        assert!(!s.allow_write_path);
        assert_eq!(s.openai_model, "gpt-4o");
    }

    #[test]
    fn test_env_overrides() {
        let s = Settings::default()
            .with_overrides(env(&[
                ("ASSESSOR_PORT", "9000"),
                ("DATABASE_URL", "postgres://assessor@db/assessor"),
                ("MAX_PAGE_SIZE", "200"),
                ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
                ("ALLOW_WRITE_PATH", "true"),
                ("API_KEY_HEADER_NAME", "X-Assessor-Key"),
            ]))
            .unwrap();
        assert_eq!(s.bind_addr(), "0.0.0.0:9000");
        assert_eq!(s.postgres_url.as_deref(), Some("postgres://assessor@db/assessor"));
        assert_eq!(s.policy().max_page_size, 200);
        assert_eq!(s.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert!(s.allow_write_path);
        assert_eq!(s.api_key_header, "x-assessor-key");
    }

    #[test]
    fn test_pg_vars_compose_conn_str() {
        let s = Settings::default()
            .with_overrides(env(&[("PGHOST", "db.internal"), ("PGPASSWORD", "it's")]))
            .unwrap();
        assert_eq!(
            s.postgres_url.as_deref(),
            Some("host='db.internal' port='5432' user='postgres' password='it\\'s' dbname='postgres'")
        );
        let parsed: tokio_postgres::Config = s.postgres_url.unwrap().parse().unwrap();
        assert_eq!(parsed.get_password(), Some("it's".as_bytes()));
    }

    #[test]
    fn test_short_api_key_is_unusable() {
        let s = Settings::default()
            .with_overrides(env(&[("MCP_API_KEY", "short")]))
            .unwrap();
        assert_eq!(s.api_key(), None);
        let s = Settings::default()
            .with_overrides(env(&[("MCP_API_KEY", "long-enough-key")]))
            .unwrap();
        assert_eq!(s.api_key(), Some("long-enough-key"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Settings::default()
            .with_overrides(env(&[("ASSESSOR_PORT", "eighty")]))
            .is_err());
        assert!(Settings::default()
            .with_overrides(env(&[("DEFAULT_PAGE_SIZE", "900")]))
            .is_err());
        assert!(Settings::default()
            .with_overrides(env(&[("MIN_PAGE_SIZE", "0")]))
            .is_err());
    }

    #[test]
    fn test_toml_layer() {
        let dir = std::env::temp_dir().join(format!("assessor-api-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "port = 8123\nmssql_conn_str = \"server=tcp:sql,1433;database=assessor\"\ndefault_page_size = 25\n",
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap().with_overrides(env(&[])).unwrap();
        assert_eq!(s.port, 8123);
        assert_eq!(s.default_page_size, 25);
        assert!(s.mssql_conn_str.is_some());
        assert_eq!(s.max_page_size, 500);

        std::fs::remove_dir_all(&dir).ok();
    }
}
