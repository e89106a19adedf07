//! LINE webhook handler
//!
//! POST /line/webhook?shop=<id> — one shared endpoint for all tenants; the
//! wire payload carries no tenant discriminator, so the shop id rides in the
//! query string. Raw body is required for signature verification.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::join_all;
use serde::Deserialize;

use crate::db::customers::PgCustomerStore;
use crate::line::{self, LineClient, Messenger, WebhookEnvelope};
use crate::linking::{CustomerStore, LinkingEngine, ShopContext};
use crate::state::AppState;
use crate::{db, util};

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    #[serde(default)]
    pub shop: Option<String>,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Resolve the tenant before touching the body.
    let Some(shop_id) = query.shop.filter(|s| !s.is_empty()) else {
        tracing::warn!("Webhook call without shop id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let shop = match db::shops::find_by_id(&state.pool, &shop_id).await {
        Ok(Some(shop)) => shop,
        Ok(None) => {
            tracing::warn!(shop_id = %shop_id, "Webhook for unknown shop");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "DB error resolving shop");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some((access_token, channel_secret)) = shop.credentials() else {
        tracing::warn!(shop_id = %shop.id, "Webhook for shop without messaging credentials");
        return StatusCode::NOT_FOUND.into_response();
    };

    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let store = PgCustomerStore::new(state.pool.clone());
    let messenger = LineClient::new(state.http.clone(), access_token.to_string());
    let ctx = ShopContext {
        shop_id: shop.id.clone(),
        shop_name: shop.name.clone(),
        card_base_url: state.public_base_url.clone(),
    };

    let status = process_webhook(&store, &messenger, &ctx, channel_secret, &body, signature).await;
    if status == StatusCode::OK {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        status.into_response()
    }
}

/// Verify, parse and fan out one webhook call for an already-resolved shop.
///
/// The signature gate runs first: nothing else — no store read, no message
/// send — happens until the raw body verifies. After the gate, every event
/// settles independently; a failed event is logged and dropped. LINE retries
/// the whole batch on non-2xx, which would duplicate already-sent replies,
/// so a verified batch always acks 200.
async fn process_webhook<S, M>(
    store: &S,
    messenger: &M,
    ctx: &ShopContext,
    channel_secret: &str,
    body: &[u8],
    signature: &str,
) -> StatusCode
where
    S: CustomerStore,
    M: Messenger,
{
    if !line::verify_signature(channel_secret, body, signature) {
        tracing::warn!(shop_id = %ctx.shop_id, "Webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(shop_id = %ctx.shop_id, error = %e, "Failed to parse webhook JSON");
            return StatusCode::BAD_REQUEST;
        }
    };

    let engine = LinkingEngine::new(store, messenger, ctx);

    let started = util::now_millis();
    let results = join_all(envelope.events.iter().map(|event| engine.handle_event(event))).await;
    for (event, result) in envelope.events.iter().zip(&results) {
        if let Err(e) = result {
            tracing::error!(
                shop_id = %ctx.shop_id,
                event_type = %event.event_type,
                error = %e,
                "event processing failed"
            );
        }
    }
    tracing::info!(
        shop_id = %ctx.shop_id,
        events = envelope.events.len(),
        elapsed_ms = util::now_millis() - started,
        "webhook batch processed"
    );

    StatusCode::OK
}
