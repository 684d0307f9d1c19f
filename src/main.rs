// Main entry point for the apparel fulfillment backend

use apparel_fulfillment::{
    api::{router, AppState},
    core::Config,
    orchestration::{BulkCollaborators, BulkOrchestrator, OrchestratorSettings, TaskRegistry},
    services::{
        Compositor, CompositorSettings, GenerationGate, HttpImageFetcher, ImageGenerator,
        MemoryStorage, MemoryStore, ObjectStorage, OpenAiPromptExpander, OrderStore,
        OrganizationStore, PassthroughExpander, PromptExpander, S3Storage, SimulatedGenerator,
        TitanGenerator,
    },
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Returned by the mock generator instead of solid colors when present
const MOCK_IMAGE_FIXTURE: &str = "images/mock_image.png";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "apparel_fulfillment={},tower_http=warn",
        level_name(config.log_level()),
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== APPAREL FULFILLMENT BACKEND ===");
    info!(
        "Config: generation={} (gate {}) storage={} retry_floor={} key_color={:?}",
        config.generation.backend,
        config.generation_concurrency(),
        config.storage.backend,
        config.retry_floor(),
        config.key_color()
    );

    let metrics = Metrics::new();

    // Collaborators
    let storage: Arc<dyn ObjectStorage> = match config.storage.backend.as_str() {
        "s3" => Arc::new(S3Storage::from_env(&config.storage.region).await),
        _ => {
            warn!("Using in-memory object storage; uploads are not persisted");
            Arc::new(MemoryStorage::new())
        }
    };

    let generator: Arc<dyn ImageGenerator> = match config.generation.backend.as_str() {
        "titan" => Arc::new(TitanGenerator::from_env(&config.generation.bedrock_region).await),
        _ => {
            let mut mock = SimulatedGenerator::new(config.generation.mock_failure_rate);
            if let Ok(bytes) = tokio::fs::read(MOCK_IMAGE_FIXTURE).await {
                info!("Mock generator serving {}", MOCK_IMAGE_FIXTURE);
                mock = mock.with_fixture(bytes);
            }
            Arc::new(mock)
        }
    };

    let expander: Arc<dyn PromptExpander> = match &config.generation.openai_api_key {
        Some(key) => Arc::new(
            OpenAiPromptExpander::new(key.clone(), config.generation.openai_model.clone())
                .context("Failed to build prompt expander client")?,
        ),
        None => {
            warn!("OPENAI_API_KEY not set; themes are used verbatim as prompts");
            Arc::new(PassthroughExpander)
        }
    };

    let fetcher = Arc::new(
        HttpImageFetcher::new(config.composite.fetch_timeout)
            .context("Failed to build HTTP client")?,
    );
    let compositor = Arc::new(Compositor::new(
        CompositorSettings::from_config(&config),
        fetcher,
        storage.clone(),
        metrics.clone(),
    ));

    let store = MemoryStore::new();
    match &config.storage.organizations_path {
        Some(path) => {
            store
                .load_organizations(path)
                .await
                .with_context(|| format!("Failed to load organizations from {}", path.display()))?;
        }
        None => warn!(
            "ORGANIZATIONS_PATH not set; bulk thumbnails stay null until organizations are stored"
        ),
    }

    let orders: Arc<dyn OrderStore> = Arc::new(store.clone());
    let organizations: Arc<dyn OrganizationStore> = Arc::new(store);
    let orchestrator = Arc::new(BulkOrchestrator::new(
        BulkCollaborators {
            generator,
            expander,
            gate: GenerationGate::new(config.generation_concurrency(), metrics.clone()),
            compositor: compositor.clone(),
            storage,
            orders: orders.clone(),
            organizations: organizations.clone(),
        },
        TaskRegistry::new(),
        OrchestratorSettings::from_config(&config),
        metrics.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        orchestrator,
        compositor,
        orders,
        organizations,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /health                - Health check");
    info!("  GET  /metrics               - Prometheus metrics");
    info!("  POST /bulk-order            - Run a bulk generation batch");
    info!("  GET  /progress/:task_id     - Batch progress snapshot");
    info!("  GET  /ws/progress/:task_id  - Batch progress (WebSocket)");
    info!("  POST /composite             - Key-color composite upload");
    info!("  POST /preview               - Pattern placement preview");
    info!("  GET  /orders/:order_id      - Order lookup");
    info!("  GET  /organizations/:org_id - Organization lookup");
    info!("  PUT  /organizations/:org_id - Organization upsert");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
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
