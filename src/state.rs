//! Application state for salon-cloud

use sqlx::PgPool;

use crate::config::Config;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL connection pool
    pub pool: PgPool,
    /// Shared HTTP client for the LINE Messaging API
    pub http: reqwest::Client,
    /// Base URL of the public member-card pages
    pub public_base_url: String,
    /// Bearer secret for the reminder sweep trigger (None only in development)
    pub cron_secret: Option<String>,
}

impl AppState {
    /// Create a new AppState
    pub async fn new(config: &Config) -> Result<Self, BoxError> {
        let pool = PgPool::connect(&config.database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            http: reqwest::Client::new(),
            public_base_url: config.public_base_url.clone(),
            cron_secret: config.cron_secret.clone(),
        })
    }
}
