//! LINE Messaging API integration via REST (no SDK dependency)
//!
//! Covers the three concerns the webhook core needs from the platform:
//! webhook signature verification, inbound event wire types, and the
//! push/reply/profile client with message payload builders.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use thiserror::Error;

const LINE_API_BASE: &str = "https://api.line.me/v2/bot";

// ==================== Signature verification ====================

/// Verify the `x-line-signature` header: base64-encoded HMAC-SHA256 of the
/// raw request body under the channel secret.
///
/// Must be fed the raw bytes as received — a reparsed/reserialized body
/// produces a different MAC. Returns false (never errors) on malformed
/// input; comparison is constant-time via `Mac::verify_slice`.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    use base64::Engine;
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ==================== Inbound wire types ====================

/// Webhook body: an envelope carrying an ordered batch of events.
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: Option<EventSource>,
    #[serde(default)]
    pub reply_token: Option<String>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

impl WebhookEvent {
    pub fn user_id(&self) -> Option<&str> {
        self.source.as_ref()?.user_id.as_deref()
    }

    /// Text content, only for message events of type "text".
    pub fn text(&self) -> Option<&str> {
        let message = self.message.as_ref()?;
        if message.message_type != "text" {
            return None;
        }
        message.text.as_deref()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

// ==================== Message payload builders ====================

pub fn text_message(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

pub fn welcome_message(shop_name: &str) -> Value {
    text_message(format!(
        "{shop_name}です。友だち追加ありがとうございます！\n\
         ご来店の記録やリマインドをこちらのトークでお届けします。"
    ))
}

pub fn link_success_message() -> Value {
    text_message(
        "連携が完了しました！\n\
         今後、ご来店のお知らせやリマインドをお届けします。",
    )
}

/// Same reply for unknown, malformed and already-consumed tokens: the bot
/// must not reveal which case occurred.
pub fn link_invalid_message() -> Value {
    text_message(
        "この連携コードは無効か、すでに使用されています。\n\
         お店のスタッフにご確認ください。",
    )
}

pub fn link_guidance_message(shop_name: &str) -> Value {
    text_message(format!(
        "{shop_name}の公式アカウントです。\n\
         ご来店時にお渡しするQRコードからご登録いただくか、\n\
         「連携コード：XXXXXXXX」の形式でコードをお送りください。"
    ))
}

/// Buttons-template card carrying the link to the member-card page.
pub fn member_card_message(shop_name: &str, card_url: &str) -> Value {
    json!({
        "type": "template",
        "altText": format!("{shop_name} 会員証"),
        "template": {
            "type": "buttons",
            "title": format!("{shop_name} 会員証"),
            "text": "タップして会員証を表示",
            "actions": [
                { "type": "uri", "label": "会員証を開く", "uri": card_url }
            ]
        }
    })
}

/// Two-part thank-you notification sent after a visit is logged:
/// the visit photo followed by an interpolated text message.
pub fn visit_thanks_messages(shop_name: &str, customer_name: &str, photo_url: &str) -> Vec<Value> {
    vec![
        json!({
            "type": "image",
            "originalContentUrl": photo_url,
            "previewImageUrl": photo_url,
        }),
        text_message(format!(
            "{customer_name}様\n\
             本日は{shop_name}にご来店いただきありがとうございました！\n\
             またのお越しをお待ちしております。"
        )),
    ]
}

pub fn reminder_message(shop_name: &str, customer_name: &str) -> Value {
    text_message(format!(
        "{customer_name}様\n\
         {shop_name}です。前回のご来店からしばらく経ちました。\n\
         そろそろ次のご予約はいかがですか？"
    ))
}

// ==================== Client ====================

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("LINE API returned {status}: {body}")]
    Api { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
}

/// Send/lookup seam: production uses [`LineClient`], tests use in-memory
/// fakes with call-count assertions.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Reply within an event's reply window (single-use reply token).
    async fn reply(&self, reply_token: &str, messages: Vec<Value>) -> Result<(), MessagingError>;
    /// Proactive push to a linked user.
    async fn push(&self, user_id: &str, messages: Vec<Value>) -> Result<(), MessagingError>;
    async fn get_profile(&self, user_id: &str) -> Result<Profile, MessagingError>;
}

/// LINE Messaging API client scoped to one shop's channel access token.
#[derive(Clone)]
pub struct LineClient {
    http: reqwest::Client,
    access_token: String,
}

impl LineClient {
    pub fn new(http: reqwest::Client, access_token: String) -> Self {
        Self { http, access_token }
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<(), MessagingError> {
        let response = self
            .http
            .post(format!("{LINE_API_BASE}{path}"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(MessagingError::Api { status, body })
        }
    }
}

#[async_trait]
impl Messenger for LineClient {
    async fn reply(&self, reply_token: &str, messages: Vec<Value>) -> Result<(), MessagingError> {
        self.post_json(
            "/message/reply",
            json!({ "replyToken": reply_token, "messages": messages }),
        )
        .await
    }

    async fn push(&self, user_id: &str, messages: Vec<Value>) -> Result<(), MessagingError> {
        self.post_json("/message/push", json!({ "to": user_id, "messages": messages }))
            .await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Profile, MessagingError> {
        let response = self
            .http
            .get(format!("{LINE_API_BASE}/profile/{user_id}"))
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MessagingError::Api { status, body });
        }
        Ok(response.json().await?)
    }
}
