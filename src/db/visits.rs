use async_trait::async_trait;
use sqlx::PgPool;

use super::StoreError;
use crate::sweep::ReminderStore;

/// One due-reminder work item: a visit joined to its customer and shop so the
/// sweeper can decide sendability per row without further lookups.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct DueReminder {
    pub visit_id: String,
    pub customer_name: String,
    pub line_user_id: Option<String>,
    pub shop_id: String,
    pub shop_name: String,
    pub channel_access_token: Option<String>,
}

pub async fn find_due_reminders(pool: &PgPool, now: i64) -> Result<Vec<DueReminder>, sqlx::Error> {
    sqlx::query_as(
        "SELECT v.id AS visit_id,
                c.name AS customer_name,
                c.line_user_id,
                s.id AS shop_id,
                s.name AS shop_name,
                s.channel_access_token
         FROM visits v
         JOIN customers c ON c.id = v.customer_id
         JOIN shops s ON s.id = c.shop_id
         WHERE v.reminder_sent = FALSE
           AND v.reminder_scheduled_at IS NOT NULL
           AND v.reminder_scheduled_at <= $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

pub async fn mark_reminder_sent(pool: &PgPool, visit_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE visits SET reminder_sent = TRUE WHERE id = $1")
        .bind(visit_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Postgres-backed store handed to the reminder sweeper.
#[derive(Clone)]
pub struct PgReminderStore {
    pool: PgPool,
}

impl PgReminderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReminderStore for PgReminderStore {
    async fn due_reminders(&self, now: i64) -> Result<Vec<DueReminder>, StoreError> {
        Ok(find_due_reminders(&self.pool, now).await?)
    }

    async fn mark_sent(&self, visit_id: &str) -> Result<(), StoreError> {
        Ok(mark_reminder_sent(&self.pool, visit_id).await?)
    }
}
