//! salon-cloud — multi-tenant salon messaging backend
//!
//! Long-running service that:
//! - Receives LINE webhook events on one shared endpoint (per-shop signature)
//! - Links anonymous chat identities to customer records (one-time tokens)
//! - Serves member-card requests over chat
//! - Sweeps due visit reminders on an external schedule

mod api;
mod config;
mod db;
mod line;
mod linking;
mod state;
mod sweep;
mod util;

use config::Config;
use state::AppState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "salon_cloud=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    tracing::info!("Starting salon-cloud (env: {})", config.environment);

    let state = AppState::new(&config).await?;
    let app = api::create_router(state);

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("salon-cloud HTTP listening on {addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
