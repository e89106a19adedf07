//! Linking state machine: associates an anonymous LINE identity with a known
//! customer record, one webhook event at a time.
//!
//! There is no stored state column. A customer's linking state is inferred
//! from the joint shape of `line_user_id` and `link_token`, so it can never
//! drift from the underlying fields.

use async_trait::async_trait;
use thiserror::Error;

use crate::db::StoreError;
use crate::db::customers::Customer;
use crate::line::{self, Messenger, WebhookEvent};
use crate::util;

/// Substrings that mean "show my member card". Matched case-insensitively
/// against the whole message.
const CARD_KEYWORDS: [&str; 5] = ["会員証", "カード", "qr", "member", "card"];

/// Textual prefix of the link command the customer types in chat.
const LINK_COMMAND_LABEL: &str = "連携コード";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Messaging(#[from] line::MessagingError),
}

/// Customer persistence seam used by the engine; Postgres in production,
/// in-memory fakes in tests.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn find_by_line_id(
        &self,
        shop_id: &str,
        line_user_id: &str,
    ) -> Result<Option<Customer>, StoreError>;

    async fn insert_self_registered(
        &self,
        shop_id: &str,
        line_user_id: &str,
        name: &str,
        now: i64,
    ) -> Result<(), StoreError>;

    /// Atomically claim an unconsumed token for this identity. Returns true
    /// iff exactly one row was updated (token matched and was still unlinked).
    async fn consume_link_token(
        &self,
        shop_id: &str,
        token: &str,
        line_user_id: &str,
    ) -> Result<bool, StoreError>;

    async fn set_member_code(&self, customer_id: &str, code: &str) -> Result<(), StoreError>;
}

/// Linking state, derived purely from the row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No row, or a row with neither identity nor token.
    Unknown,
    /// Row with the LINE identity set.
    Linked,
    /// Row waiting for its one-time token to be presented.
    Pending,
}

pub fn infer_state(row: Option<&Customer>) -> LinkState {
    match row {
        None => LinkState::Unknown,
        Some(c) if c.line_user_id.as_deref().is_some_and(|v| !v.is_empty()) => LinkState::Linked,
        Some(c) if c.link_token.as_deref().is_some_and(|v| !v.is_empty()) => LinkState::Pending,
        Some(_) => LinkState::Unknown,
    }
}

/// Parse a "連携コード: TOKEN" message. Tolerates full-width and half-width
/// colons and surrounding whitespace.
pub fn parse_link_command(text: &str) -> Option<&str> {
    let rest = text.trim().strip_prefix(LINK_COMMAND_LABEL)?;
    let rest = rest.trim_start().strip_prefix(['：', ':'])?;
    let token = rest.trim();
    (!token.is_empty()).then_some(token)
}

pub fn wants_member_card(text: &str) -> bool {
    let lower = text.to_lowercase();
    CARD_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// The shop an event batch was resolved to, plus what the engine needs to
/// build user-facing strings.
#[derive(Debug, Clone)]
pub struct ShopContext {
    pub shop_id: String,
    pub shop_name: String,
    /// Base URL of the public card page, no trailing slash.
    pub card_base_url: String,
}

impl ShopContext {
    pub fn card_url(&self, member_code: &str) -> String {
        format!("{}/card/{member_code}", self.card_base_url.trim_end_matches('/'))
    }
}

/// Per-batch engine: borrows the store, the shop-scoped messenger and the
/// shop context, and applies one transition per event.
pub struct LinkingEngine<'a, S, M> {
    store: &'a S,
    messenger: &'a M,
    shop: &'a ShopContext,
}

impl<'a, S: CustomerStore, M: Messenger> LinkingEngine<'a, S, M> {
    pub fn new(store: &'a S, messenger: &'a M, shop: &'a ShopContext) -> Self {
        Self { store, messenger, shop }
    }

    /// Apply the transition for one event. Errors are returned to the caller,
    /// which logs them at the event boundary; they never fail the batch.
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<(), EngineError> {
        match event.event_type.as_str() {
            "follow" => self.on_follow(event).await,
            "message" => match event.text() {
                Some(text) => self.on_text(event, text).await,
                // Sticker/image/etc.: deliberately ignored.
                None => Ok(()),
            },
            // unfollow, join, postback, ...: nothing to do.
            _ => Ok(()),
        }
    }

    async fn on_follow(&self, event: &WebhookEvent) -> Result<(), EngineError> {
        let Some(user_id) = event.user_id() else {
            return Ok(());
        };

        let existing = self.store.find_by_line_id(&self.shop.shop_id, user_id).await?;
        if existing.is_none() {
            // Self-registration: the follower is not a known customer, so
            // create one from their LINE profile, born linked.
            let profile = self.messenger.get_profile(user_id).await?;
            self.store
                .insert_self_registered(
                    &self.shop.shop_id,
                    user_id,
                    &profile.display_name,
                    util::now_millis(),
                )
                .await?;
            tracing::info!(
                shop_id = %self.shop.shop_id,
                line_user_id = user_id,
                "customer self-registered via follow"
            );
        }

        // Welcome on every follow; re-following must not duplicate rows.
        if let Some(reply_token) = &event.reply_token {
            self.messenger
                .reply(reply_token, vec![line::welcome_message(&self.shop.shop_name)])
                .await?;
        }
        Ok(())
    }

    async fn on_text(&self, event: &WebhookEvent, text: &str) -> Result<(), EngineError> {
        let Some(user_id) = event.user_id() else {
            return Ok(());
        };

        let row = self.store.find_by_line_id(&self.shop.shop_id, user_id).await?;
        match infer_state(row.as_ref()) {
            LinkState::Linked => {
                if wants_member_card(text) {
                    if let Some(customer) = row.as_ref() {
                        self.send_member_card(event, customer).await?;
                    }
                }
                // Any other text from a linked customer: silence, by policy.
                Ok(())
            }
            LinkState::Unknown | LinkState::Pending => self.on_unlinked_text(event, user_id, text).await,
        }
    }

    async fn on_unlinked_text(
        &self,
        event: &WebhookEvent,
        user_id: &str,
        text: &str,
    ) -> Result<(), EngineError> {
        let Some(reply_token) = &event.reply_token else {
            return Ok(());
        };

        let reply = match parse_link_command(text) {
            Some(token) => {
                let linked = self
                    .store
                    .consume_link_token(&self.shop.shop_id, token, user_id)
                    .await?;
                if linked {
                    tracing::info!(
                        shop_id = %self.shop.shop_id,
                        line_user_id = user_id,
                        "customer linked via token"
                    );
                    line::link_success_message()
                } else {
                    line::link_invalid_message()
                }
            }
            None => line::link_guidance_message(&self.shop.shop_name),
        };

        self.messenger.reply(reply_token, vec![reply]).await?;
        Ok(())
    }

    async fn send_member_card(
        &self,
        event: &WebhookEvent,
        customer: &Customer,
    ) -> Result<(), EngineError> {
        let code = match customer.member_code.as_deref().filter(|c| !c.is_empty()) {
            Some(code) => code.to_string(),
            None => {
                let code = util::generate_member_code();
                self.store.set_member_code(&customer.id, &code).await?;
                code
            }
        };

        if let Some(reply_token) = &event.reply_token {
            let card = line::member_card_message(&self.shop.shop_name, &self.shop.card_url(&code));
            self.messenger.reply(reply_token, vec![card]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{MessagingError, Profile};
    use serde_json::Value;
    use std::sync::Mutex;

    fn customer(id: &str, line_user_id: Option<&str>, link_token: Option<&str>) -> Customer {
        Customer {
            id: id.into(),
            shop_id: "shop-1".into(),
            name: "山田".into(),
            line_user_id: line_user_id.map(String::from),
            link_token: link_token.map(String::from),
            member_code: None,
            notes: None,
            last_visit_at: None,
            created_at: 0,
        }
    }

    fn shop_ctx() -> ShopContext {
        ShopContext {
            shop_id: "shop-1".into(),
            shop_name: "Salon Luna".into(),
            card_base_url: "https://salon.example.com".into(),
        }
    }

    fn event(event_type: &str, user_id: &str, reply_token: Option<&str>, text: Option<&str>) -> WebhookEvent {
        let mut value = serde_json::json!({
            "type": event_type,
            "source": { "userId": user_id },
        });
        if let Some(rt) = reply_token {
            value["replyToken"] = rt.into();
        }
        if let Some(text) = text {
            value["message"] = serde_json::json!({ "type": "text", "text": text });
        }
        serde_json::from_value(value).unwrap()
    }

    #[derive(Default)]
    struct FakeStore {
        customers: Mutex<Vec<Customer>>,
        inserts: Mutex<u32>,
        consume_calls: Mutex<u32>,
    }

    impl FakeStore {
        fn with(customers: Vec<Customer>) -> Self {
            Self { customers: Mutex::new(customers), ..Default::default() }
        }
    }

    #[async_trait]
    impl CustomerStore for FakeStore {
        async fn find_by_line_id(
            &self,
            shop_id: &str,
            line_user_id: &str,
        ) -> Result<Option<Customer>, StoreError> {
            Ok(self
                .customers
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.shop_id == shop_id && c.line_user_id.as_deref() == Some(line_user_id))
                .cloned())
        }

        async fn insert_self_registered(
            &self,
            shop_id: &str,
            line_user_id: &str,
            name: &str,
            _now: i64,
        ) -> Result<(), StoreError> {
            *self.inserts.lock().unwrap() += 1;
            let mut c = customer("generated", Some(line_user_id), None);
            c.shop_id = shop_id.into();
            c.name = name.into();
            self.customers.lock().unwrap().push(c);
            Ok(())
        }

        async fn consume_link_token(
            &self,
            shop_id: &str,
            token: &str,
            line_user_id: &str,
        ) -> Result<bool, StoreError> {
            *self.consume_calls.lock().unwrap() += 1;
            let mut customers = self.customers.lock().unwrap();
            let target = customers.iter_mut().find(|c| {
                c.shop_id == shop_id
                    && c.link_token.as_deref() == Some(token)
                    && !token.is_empty()
                    && c.line_user_id.as_deref().unwrap_or("").is_empty()
            });
            match target {
                Some(c) => {
                    c.line_user_id = Some(line_user_id.into());
                    c.link_token = Some(String::new());
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn set_member_code(&self, customer_id: &str, code: &str) -> Result<(), StoreError> {
            let mut customers = self.customers.lock().unwrap();
            let c = customers
                .iter_mut()
                .find(|c| c.id == customer_id)
                .ok_or_else(|| StoreError::Other("no such customer".into()))?;
            c.member_code = Some(code.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        replies: Mutex<Vec<(String, Vec<Value>)>>,
        pushes: Mutex<Vec<(String, Vec<Value>)>>,
        profile_calls: Mutex<u32>,
    }

    impl FakeMessenger {
        fn reply_texts(&self) -> Vec<String> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, msgs)| msgs.iter())
                .filter_map(|m| m["text"].as_str().map(String::from))
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn reply(&self, reply_token: &str, messages: Vec<Value>) -> Result<(), MessagingError> {
            self.replies.lock().unwrap().push((reply_token.into(), messages));
            Ok(())
        }

        async fn push(&self, user_id: &str, messages: Vec<Value>) -> Result<(), MessagingError> {
            self.pushes.lock().unwrap().push((user_id.into(), messages));
            Ok(())
        }

        async fn get_profile(&self, _user_id: &str) -> Result<Profile, MessagingError> {
            *self.profile_calls.lock().unwrap() += 1;
            Ok(Profile { display_name: "新規さん".into() })
        }
    }

    #[test]
    fn state_is_inferred_from_row_shape() {
        assert_eq!(infer_state(None), LinkState::Unknown);
        assert_eq!(infer_state(Some(&customer("c1", Some("U1"), None))), LinkState::Linked);
        assert_eq!(infer_state(Some(&customer("c1", None, Some("TOK")))), LinkState::Pending);
        assert_eq!(infer_state(Some(&customer("c1", Some(""), Some("")))), LinkState::Unknown);
    }

    #[test]
    fn link_command_tolerates_colon_variants_and_whitespace() {
        assert_eq!(parse_link_command("連携コード：ABCD1234"), Some("ABCD1234"));
        assert_eq!(parse_link_command("連携コード: ABCD1234"), Some("ABCD1234"));
        assert_eq!(parse_link_command("  連携コード ：  ABCD1234  "), Some("ABCD1234"));
        assert_eq!(parse_link_command("連携コード："), None);
        assert_eq!(parse_link_command("連携コード ABCD1234"), None);
        assert_eq!(parse_link_command("こんにちは"), None);
    }

    #[test]
    fn card_keywords_match_case_insensitive_substrings() {
        assert!(wants_member_card("QRください"));
        assert!(wants_member_card("会員証お願いします"));
        assert!(wants_member_card("my CARD please"));
        assert!(!wants_member_card("こんにちは"));
    }

    #[tokio::test]
    async fn token_links_customer_and_is_single_use() {
        let store = FakeStore::with(vec![customer("c1", None, Some("ABCD1234"))]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        // Full-width colon, as typed from a Japanese keyboard.
        let ev = event("message", "U999", Some("rt-1"), Some("連携コード：ABCD1234"));
        engine.handle_event(&ev).await.unwrap();

        {
            let customers = store.customers.lock().unwrap();
            assert_eq!(customers[0].line_user_id.as_deref(), Some("U999"));
            assert_eq!(customers[0].link_token.as_deref(), Some(""));
        }
        assert!(messenger.reply_texts().iter().any(|t| t.contains("連携が完了しました")));

        // Replaying the same token from another identity gets the generic reply.
        let replay = event("message", "U777", Some("rt-2"), Some("連携コード：ABCD1234"));
        engine.handle_event(&replay).await.unwrap();
        assert!(messenger.reply_texts().iter().any(|t| t.contains("無効か、すでに使用")));
        let customers = store.customers.lock().unwrap();
        assert_eq!(customers[0].line_user_id.as_deref(), Some("U999"));
    }

    #[tokio::test]
    async fn unknown_sender_without_token_gets_guidance_and_no_mutation() {
        let store = FakeStore::with(vec![customer("c1", None, Some("ABCD1234"))]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        let ev = event("message", "U888", Some("rt-1"), Some("こんにちは"));
        engine.handle_event(&ev).await.unwrap();

        assert_eq!(*store.inserts.lock().unwrap(), 0);
        assert_eq!(*store.consume_calls.lock().unwrap(), 0);
        assert_eq!(messenger.replies.lock().unwrap().len(), 1);
        assert!(messenger.reply_texts()[0].contains("QRコード"));
    }

    #[tokio::test]
    async fn linked_sender_card_request_generates_and_persists_code() {
        let store = FakeStore::with(vec![customer("c1", Some("U999"), None)]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        let ev = event("message", "U999", Some("rt-1"), Some("会員証お願いします"));
        engine.handle_event(&ev).await.unwrap();

        let code = {
            let customers = store.customers.lock().unwrap();
            customers[0].member_code.clone().expect("member code persisted")
        };
        assert_eq!(code.len(), 8);

        let replies = messenger.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        let card = &replies[0].1[0];
        assert_eq!(card["type"], "template");
        assert_eq!(
            card["template"]["actions"][0]["uri"],
            format!("https://salon.example.com/card/{code}")
        );
    }

    #[tokio::test]
    async fn linked_sender_existing_code_is_reused() {
        let mut c = customer("c1", Some("U999"), None);
        c.member_code = Some("ZZZZ9999".into());
        let store = FakeStore::with(vec![c]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        engine
            .handle_event(&event("message", "U999", Some("rt-1"), Some("QR")))
            .await
            .unwrap();

        let replies = messenger.replies.lock().unwrap();
        assert_eq!(
            replies[0].1[0]["template"]["actions"][0]["uri"],
            "https://salon.example.com/card/ZZZZ9999"
        );
    }

    #[tokio::test]
    async fn linked_sender_ordinary_text_gets_silence() {
        let store = FakeStore::with(vec![customer("c1", Some("U999"), None)]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        engine
            .handle_event(&event("message", "U999", Some("rt-1"), Some("ありがとう")))
            .await
            .unwrap();

        assert!(messenger.replies.lock().unwrap().is_empty());
        assert!(messenger.pushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn follow_from_stranger_self_registers_with_profile_name() {
        let store = FakeStore::default();
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        engine
            .handle_event(&event("follow", "U555", Some("rt-1"), None))
            .await
            .unwrap();

        assert_eq!(*store.inserts.lock().unwrap(), 1);
        assert_eq!(*messenger.profile_calls.lock().unwrap(), 1);
        {
            let customers = store.customers.lock().unwrap();
            assert_eq!(customers[0].name, "新規さん");
            assert_eq!(customers[0].line_user_id.as_deref(), Some("U555"));
        }
        assert!(messenger.reply_texts()[0].contains("友だち追加ありがとうございます"));
    }

    #[tokio::test]
    async fn follow_is_idempotent_for_known_customer() {
        let store = FakeStore::with(vec![customer("c1", Some("U999"), None)]);
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        engine.handle_event(&event("follow", "U999", Some("rt-1"), None)).await.unwrap();
        engine.handle_event(&event("follow", "U999", Some("rt-2"), None)).await.unwrap();

        assert_eq!(*store.inserts.lock().unwrap(), 0);
        assert_eq!(*messenger.profile_calls.lock().unwrap(), 0);
        assert_eq!(messenger.replies.lock().unwrap().len(), 2);
        assert_eq!(store.customers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_text_and_unknown_events_are_ignored() {
        let store = FakeStore::default();
        let messenger = FakeMessenger::default();
        let ctx = shop_ctx();
        let engine = LinkingEngine::new(&store, &messenger, &ctx);

        let sticker: WebhookEvent = serde_json::from_value(serde_json::json!({
            "type": "message",
            "replyToken": "rt-1",
            "source": { "userId": "U999" },
            "message": { "type": "sticker" }
        }))
        .unwrap();
        engine.handle_event(&sticker).await.unwrap();
        engine.handle_event(&event("unfollow", "U999", None, None)).await.unwrap();

        assert!(messenger.replies.lock().unwrap().is_empty());
        assert_eq!(*store.inserts.lock().unwrap(), 0);
        assert_eq!(*store.consume_calls.lock().unwrap(), 0);
    }
}
