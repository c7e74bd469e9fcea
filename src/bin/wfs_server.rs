// src/bin/wfs_server.rs

use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use wfs_service::transport;
use wfs_service::{ModelRegistry, PgCatalog, PgExecutor, Settings, SharedModelRegistry, WfsService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wfs_service=info,tower_http=info")),
        )
        .init();

    let settings = Settings::from_env()?;

    // --- Database + catalog ---
    info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(&settings.database_url)
        .await?;
    let catalog = PgCatalog::new(pool.clone());
    catalog.ensure_schema().await?;

    // --- Warm-start model registry from the published feature types ---
    //
    // Models referenced later are introspected on first use.
    let registry = match ModelRegistry::load_from_db(&pool).await {
        Ok(reg) => {
            info!(models = ?reg.list_models(), "warm-started model registry");
            reg
        }
        Err(e) => {
            warn!(error = %e, "could not load models on startup (continuing with empty registry)");
            ModelRegistry::new()
        }
    };
    let models = SharedModelRegistry::new(registry, Some(pool.clone()));

    let wfs = WfsService::new(
        Arc::new(catalog),
        Arc::new(models),
        Arc::new(PgExecutor::new(pool.clone(), settings.cursor_buffer)),
        settings.public_url.clone(),
    );
    let app_state = transport::http::AppState::new(wfs, Some(pool))
        .with_legacy_version_negotiation(settings.legacy_version_negotiation);

    // --- API Server Initialization ---
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    let app = transport::http::create_router(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", transport::http::ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!("WFS server listening on http://{}", settings.bind_addr);
    info!("Swagger UI available at {}/swagger-ui", settings.public_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    info!("graceful shutdown complete");
    Ok(())
}
