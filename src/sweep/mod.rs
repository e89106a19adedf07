//! Reminder sweeper: finds due, unsent visit reminders and pushes them
//! through each shop's messaging channel.
//!
//! Rows are processed independently and concurrently; a single row can skip
//! or fail without affecting its siblings. Only the initial due-reminder
//! query is fatal for a run.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;

use crate::db::StoreError;
use crate::db::visits::DueReminder;
use crate::line::{self, Messenger};

/// Visit/reminder persistence seam; Postgres in production, fakes in tests.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn due_reminders(&self, now: i64) -> Result<Vec<DueReminder>, StoreError>;
    async fn mark_sent(&self, visit_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Sent,
    Skipped,
    Failed,
}

/// Per-row result reported back to the trigger caller.
#[derive(Debug, Serialize)]
pub struct RowOutcome {
    pub id: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Run one sweep. `messenger_for` builds a shop-scoped messenger from a
/// channel access token (one shared HTTP client underneath in production).
pub async fn run_sweep<S, M, F>(
    store: &S,
    messenger_for: &F,
    now: i64,
) -> Result<Vec<RowOutcome>, StoreError>
where
    S: ReminderStore,
    M: Messenger,
    F: Fn(String) -> M + Sync,
{
    let due = store.due_reminders(now).await?;
    tracing::info!(count = due.len(), "reminder sweep started");

    let outcomes = join_all(
        due.iter()
            .map(|row| process_row(store, messenger_for, row)),
    )
    .await;

    let sent = outcomes.iter().filter(|o| o.status == OutcomeStatus::Sent).count();
    tracing::info!(total = outcomes.len(), sent, "reminder sweep finished");
    Ok(outcomes)
}

async fn process_row<S, M, F>(store: &S, messenger_for: &F, row: &DueReminder) -> RowOutcome
where
    S: ReminderStore,
    M: Messenger,
    F: Fn(String) -> M + Sync,
{
    let line_user_id = row.line_user_id.as_deref().filter(|v| !v.is_empty());
    let access_token = row.channel_access_token.as_deref().filter(|v| !v.is_empty());

    // Unlinked customer or unconfigured shop: nothing to send, leave the row
    // unsent so it shows up again once the data is fixed.
    let (Some(line_user_id), Some(access_token)) = (line_user_id, access_token) else {
        tracing::warn!(
            visit_id = %row.visit_id,
            shop_id = %row.shop_id,
            "reminder skipped: customer not linked or shop not configured"
        );
        return RowOutcome {
            id: row.visit_id.clone(),
            status: OutcomeStatus::Skipped,
            reason: Some("missing_data".into()),
        };
    };

    let messenger = messenger_for(access_token.to_string());
    let message = line::reminder_message(&row.shop_name, &row.customer_name);
    if let Err(e) = messenger.push(line_user_id, vec![message]).await {
        tracing::error!(visit_id = %row.visit_id, error = %e, "reminder push failed");
        return RowOutcome {
            id: row.visit_id.clone(),
            status: OutcomeStatus::Failed,
            reason: Some("send_failed".into()),
        };
    }

    if let Err(e) = store.mark_sent(&row.visit_id).await {
        // The push went out but the flag flip failed; the row will be retried
        // next run and may double-send. Surface it as failed, not sent.
        tracing::error!(visit_id = %row.visit_id, error = %e, "failed to mark reminder sent");
        return RowOutcome {
            id: row.visit_id.clone(),
            status: OutcomeStatus::Failed,
            reason: Some("store_failed".into()),
        };
    }

    RowOutcome { id: row.visit_id.clone(), status: OutcomeStatus::Sent, reason: None }
}
