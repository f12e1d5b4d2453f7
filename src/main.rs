use anyhow::Result;
use assessor_api::config::Settings;
use assessor_api::db::{ConnectionProvider, DatabasePools};
use assessor_api::executor::QueryExecutor;
use assessor_api::nl::{FallbackTranslator, OpenAiTranslator, SqlTranslator};
use assessor_api::server::{self, ApiKeyGate, AppState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Validated, paginated SQL over the assessor databases
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Address to bind (overrides ASSESSOR_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides ASSESSOR_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let pools = Arc::new(DatabasePools::open(&settings)?);
    let executor = QueryExecutor::new(pools.clone())
        .with_policy(settings.policy())
        .with_timeout(settings.query_timeout())
        .with_write_path(settings.allow_write_path);

    let primary: Option<Box<dyn SqlTranslator>> = match &settings.openai_api_key {
        Some(key) => Some(Box::new(OpenAiTranslator::new(
            key.as_str(),
            settings.openai_model.as_str(),
            settings.openai_base_url.as_str(),
        )?)),
        None => {
            tracing::warn!("OPENAI_API_KEY not set; natural-language translation uses keyword fallback");
            None
        }
    };

    let gate = ApiKeyGate::new(&settings.api_key_header, settings.api_key());
    if !gate.is_enabled() {
        tracing::warn!(
            "MCP_API_KEY missing or shorter than {} characters; protected routes will deny every request",
            assessor_api::config::MIN_API_KEY_LEN
        );
    }

    let state = AppState::new(executor, Arc::new(FallbackTranslator::new(primary)), gate);
    let served = server::serve(&settings, state).await;

    pools.close_all().await;
    served
}
