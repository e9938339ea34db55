//! services/app/src/bin/app.rs

use app_lib::{
    adapters::{HttpInferenceAdapter, PgAssessmentStore, PgIdentityAdapter},
    config::Config,
    error::ApiError,
    web::{router, state::AppState},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage_core::ports::InferenceService;
use triage_core::AuthSession;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting station...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PgAssessmentStore::new(db_pool.clone()));
    info!("Running database migrations...");
    store.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let backend = Arc::new(HttpInferenceAdapter::new(
        &config.backend_base_url,
        config.backend_timeout,
    )?);
    match backend.health().await {
        Ok(status) => info!("Inference backend at {} is {}", config.backend_base_url, status),
        Err(e) => warn!(
            "Inference backend at {} is not reachable yet: {}",
            config.backend_base_url, e
        ),
    }

    // --- 4. Restore the Station's Sign-In ---
    let identity = Arc::new(PgIdentityAdapter::new(db_pool));
    let session = AuthSession::mount(identity);

    // --- 5. Build the Shared AppState & Router ---
    let app_state = Arc::new(AppState::new(config.clone(), session.clone(), store, backend));
    let app = router(app_state)?;

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    session.unmount();
    info!("Station stopped.");
    Ok(())
}
