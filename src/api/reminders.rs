//! Reminder sweep trigger
//!
//! GET /api/reminders/run — called by the scheduler, authenticated by a
//! single operational bearer secret (not tenant-scoped). Responds 200 with
//! the per-row outcome list; only a failed due-rows query is a 500.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::db::visits::PgReminderStore;
use crate::line::LineClient;
use crate::state::AppState;
use crate::{sweep, util};

pub async fn run_reminders(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match &state.cron_secret {
        Some(secret) => {
            let bearer = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if bearer != Some(secret.as_str()) {
                tracing::warn!("Reminder sweep called with missing or wrong secret");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
        // Only reachable in development; config refuses to boot without the
        // secret anywhere else.
        None => tracing::warn!("CRON_SECRET not set; reminder endpoint is unauthenticated"),
    }

    let store = PgReminderStore::new(state.pool.clone());
    let http = state.http.clone();
    let messenger_for = move |token: String| LineClient::new(http.clone(), token);

    match sweep::run_sweep(&store, &messenger_for, util::now_millis()).await {
        Ok(outcomes) => Json(serde_json::json!({ "results": outcomes })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "due-reminder query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
