use sqlx::PgPool;

/// A tenant: one salon, owning its own LINE channel credentials.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Shop {
    pub id: String,
    pub name: String,
    /// LINE channel access token (push credential). Empty until onboarding completes.
    pub channel_access_token: Option<String>,
    /// LINE channel secret (webhook signing secret).
    pub channel_secret: Option<String>,
    /// Human-facing bot id shown on printed QR material (e.g. "@123abcd").
    pub bot_basic_id: Option<String>,
    pub created_at: i64,
}

impl Shop {
    /// Both credentials, or None. A shop missing either one cannot verify
    /// webhooks or send replies, so the webhook must reject it outright.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.channel_access_token.as_deref().filter(|s| !s.is_empty())?;
        let secret = self.channel_secret.as_deref().filter(|s| !s.is_empty())?;
        Some((token, secret))
    }
}

pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<Shop>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM shops WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}
