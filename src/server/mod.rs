//! HTTP surface. Route handlers stay thin: every query goes through the
//! shared [`QueryExecutor`].

mod auth;
mod error;
mod routes;

use anyhow::{Context, Result};
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::executor::QueryExecutor;
use crate::nl::SqlTranslator;

pub use auth::ApiKeyGate;
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<QueryExecutor>,
    pub translator: Arc<dyn SqlTranslator>,
    pub gate: Arc<ApiKeyGate>,
}

impl AppState {
    pub fn new(
        executor: QueryExecutor,
        translator: Arc<dyn SqlTranslator>,
        gate: ApiKeyGate,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            translator,
            gate: Arc::new(gate),
        }
    }
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let protected = Router::new()
        .route("/run-query", post(routes::run_query))
        .route("/nl-to-sql", post(routes::nl_to_sql))
        .route("/export", post(routes::export))
        .route("/discover-schema", get(routes::discover_schema))
        .route("/schema-summary", get(routes::schema_summary))
        .route("/api/parcels", get(routes::list_parcels))
        .route("/api/parcels/{id}", get(routes::parcel_detail))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins, &state.gate))
}

fn cors_layer(allowed_origins: &[String], gate: &ApiKeyGate) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let mut headers: Vec<HeaderName> = vec![header::CONTENT_TYPE, header::AUTHORIZATION];
    headers.push(gate.header_name().clone());

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(headers)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(settings: &Settings, state: AppState) -> Result<()> {
    let app = router(state, &settings.allowed_origins);
    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}
