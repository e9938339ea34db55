//! services/app/src/bin/add_user.rs
//!
//! Provisions an operator account for the station.
//!
//! Usage: `add_user <email>`, with the password read from the
//! `STATION_PASSWORD` environment variable so it stays out of shell history.

use app_lib::{adapters::PgIdentityAdapter, adapters::PgAssessmentStore, config::Config, error::ApiError};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let email = std::env::args()
        .nth(1)
        .ok_or_else(|| ApiError::Internal("Usage: add_user <email>".to_string()))?;
    let password = std::env::var("STATION_PASSWORD")
        .map_err(|_| ApiError::Internal("STATION_PASSWORD must be set".to_string()))?;

    let db_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await?;
    PgAssessmentStore::new(db_pool.clone()).run_migrations().await?;

    let user = PgIdentityAdapter::new(db_pool)
        .create_user(&email, &password)
        .await?;
    info!(
        "Created operator {} ({})",
        user.email.as_deref().unwrap_or_default(),
        user.id
    );
    Ok(())
}
