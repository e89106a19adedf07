//! API routes for salon-cloud

pub mod health;
pub mod line_webhook;
pub mod reminders;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the combined router
pub fn create_router(state: AppState) -> Router {
    // LINE webhook (signature-verified, raw body, shared across tenants)
    let webhook = Router::new().route("/line/webhook", post(line_webhook::handle_webhook));

    // Scheduled reminder sweep (bearer secret)
    let reminders = Router::new().route("/api/reminders/run", get(reminders::run_reminders));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(webhook)
        .merge(reminders)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
