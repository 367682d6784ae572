// Service entry point: exposes enrichment runs and monitoring over HTTP

use post_insight::{
    core::Config,
    orchestration::EnrichmentOrchestrator,
    services::{ImageConverter, JsonFilePostSource, JsonFileStore, OpenAiClient},
    utils::Metrics,
    BatchRunStats,
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<EnrichmentOrchestrator>,
    metrics: Metrics,
    /// Held for the duration of a run; overlapping runs would race on the same batch
    run_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Default, Deserialize)]
struct EnrichRequest {
    window_hours: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!("post_insight={}", level_name(config.log_level())));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== POST INSIGHT ===");
    info!(
        "Models: text={} vision={} (max {} images/call)",
        config.text_model(),
        config.vision_model(),
        config.max_images_per_call()
    );
    if config.llm.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; model calls will likely be rejected");
    }

    let metrics = Metrics::new();

    let store = Arc::new(
        JsonFileStore::open(&config.store.interpretations_file)
            .await
            .context("Failed to open interpretation store")?,
    );
    let source = Arc::new(JsonFilePostSource::new(
        &config.store.posts_file,
        store.clone(),
    ));
    let client = Arc::new(OpenAiClient::new(&config, None, Some(metrics.clone()))?);
    let converter = Arc::new(ImageConverter::new(&config)?);

    let orchestrator = Arc::new(EnrichmentOrchestrator::new(
        &config,
        source,
        store,
        client,
        converter,
        Some(metrics.clone()),
    ));

    let state = AppState {
        config: config.clone(),
        orchestrator,
        metrics,
        run_lock: Arc::new(Mutex::new(())),
    };

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("Endpoints:");
    info!("  GET  /                      - Root endpoint");
    info!("  GET  /health                - Health check");
    info!("  GET  /metrics               - Prometheus metrics");
    info!("  GET  /stats                 - Detailed statistics");
    info!("  GET  /interpretations/stats - Stored interpretation counts");
    info!("  POST /enrich                - Run enrichment ({{\"window_hours\": n}})");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/interpretations/stats", get(interpretation_stats))
        .route("/enrich", post(enrich))
        .with_state(state)
        .layer(cors)
}

fn level_name(level: tracing::Level) -> &'static str {
    match level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

async fn root() -> &'static str {
    "Post Insight - social post enrichment pipeline"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "metrics": state.metrics.snapshot(),
        "pools": {
            "vision_workers": state.config.workers.vision_workers,
            "text_workers": state.config.workers.text_workers,
            "conversion_workers": state.config.workers.conversion_workers,
        },
    }))
}

async fn interpretation_stats(
    State(state): State<AppState>,
) -> Result<Json<post_insight::StoreStats>, (StatusCode, String)> {
    state.orchestrator.store().stats().await.map(Json).map_err(|e| {
        error!("Failed to read store statistics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

/// Run enrichment over the configured (or requested) look-back window
async fn enrich(
    State(state): State<AppState>,
    request: Option<Json<EnrichRequest>>,
) -> Result<Json<BatchRunStats>, (StatusCode, String)> {
    let window_hours = request
        .and_then(|Json(r)| r.window_hours)
        .unwrap_or_else(|| state.config.default_window_hours());

    let Ok(_guard) = state.run_lock.try_lock() else {
        return Err((
            StatusCode::CONFLICT,
            "an enrichment run is already in progress".to_string(),
        ));
    };

    state
        .orchestrator
        .run_enrichment(window_hours)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Enrichment run failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })
}
