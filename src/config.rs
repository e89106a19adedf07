//! Server configuration

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// HTTP port
    pub http_port: u16,
    /// Environment: development | staging | production
    pub environment: String,
    /// Base URL of the public member-card pages
    pub public_base_url: String,
    /// Bearer secret for the reminder sweep trigger. May only be absent in
    /// development (the endpoint is then unauthenticated).
    pub cron_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let cron_secret = match std::env::var("CRON_SECRET") {
            Ok(v) if !v.is_empty() => Some(v),
            _ if environment == "development" => None,
            _ => {
                return Err(
                    format!("CRON_SECRET must be set in {environment} environment").into(),
                );
            }
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?,
            http_port: std::env::var("HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            environment,
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "https://app.salon-cloud.jp".into()),
            cron_secret,
        })
    }
}
