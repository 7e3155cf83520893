use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use storefront_config::Config;
use storefront_contracts::{
    ActionEnvelope, InboundEvent, InboundPayload, OrderStatus, OutboundMessage, Product,
    ProductKind, UserId,
};
use storefront_server::completion::{
    CompletionError, CompletionService, TextCompletion, VisionCompletion,
};
use storefront_server::{build_app_with, Dispatcher, EngineError, RecordingTransport};

const ADMIN: UserId = 1;
const OTHER_ADMIN: UserId = 2;
const BUYER: UserId = 10;

/// Completion fake answering text requests from a queue.
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    vision: Option<String>,
}

#[async_trait]
impl CompletionService for Scripted {
    async fn complete_text(&self, _: TextCompletion) -> Result<String, CompletionError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(CompletionError::Status(503))
    }

    async fn complete_vision(&self, _: VisionCompletion) -> Result<String, CompletionError> {
        self.vision.clone().ok_or(CompletionError::Status(503))
    }
}

struct Harness {
    bot: Arc<Dispatcher>,
    chat: Arc<RecordingTransport>,
}

async fn harness_with(cooldown_ms: u64, replies: &[&str], vision: Option<&str>) -> Harness {
    let mut cfg = Config::default();
    cfg.gate.cooldown_ms = cooldown_ms;
    let chat = Arc::new(RecordingTransport::new());
    let ai = Arc::new(Scripted {
        replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        vision: vision.map(str::to_string),
    });
    let (_, bot) = build_app_with(cfg, chat.clone(), ai).await.unwrap();
    bot.store()
        .users
        .update(|users| {
            for id in [ADMIN, OTHER_ADMIN] {
                users.entry(id).or_default().is_admin = true;
            }
        })
        .await
        .unwrap();
    bot.store()
        .products
        .update(|products| {
            products.extend([
                product(1, ProductKind::Weapon, 100),
                product(2, ProductKind::Armor, 50),
                product(3, ProductKind::Weapon, 40),
                product(4, ProductKind::Escort, 300),
            ])
        })
        .await
        .unwrap();
    Harness { bot, chat }
}

async fn harness(replies: &[&str]) -> Harness {
    harness_with(0, replies, None).await
}

fn product(id: u64, kind: ProductKind, price: u64) -> Product {
    Product {
        id,
        title: format!("Item {id}"),
        kind,
        category: "test".to_string(),
        price,
        description: String::new(),
    }
}

fn event(user_id: UserId, payload: InboundPayload) -> InboundEvent {
    InboundEvent {
        event_id: None,
        user_id,
        chat_id: user_id,
        username: Some(format!("user{user_id}")),
        payload,
    }
}

fn text(user_id: UserId, text: &str) -> InboundEvent {
    event(
        user_id,
        InboundPayload::Text {
            text: text.to_string(),
        },
    )
}

fn button(user_id: UserId, data: &str) -> InboundEvent {
    event(
        user_id,
        InboundPayload::Button {
            data: data.to_string(),
            callback_id: None,
            message_id: None,
        },
    )
}

fn photo(user_id: UserId, file_id: &str) -> InboundEvent {
    event(
        user_id,
        InboundPayload::Photo {
            file_id: file_id.to_string(),
        },
    )
}

impl Harness {
    async fn send(&self, events: Vec<InboundEvent>) {
        for e in events {
            assert!(self.bot.handle(e).await, "event dropped by cooldown");
        }
    }

    async fn last_text(&self, user_id: UserId) -> String {
        self.chat.texts_to(user_id).await.pop().unwrap_or_default()
    }

    async fn checkout(&self, user_id: UserId, items: &[u64]) -> u64 {
        let mut events: Vec<InboundEvent> = items
            .iter()
            .map(|id| button(user_id, &format!("cart:add:{id}")))
            .collect();
        events.push(button(user_id, "cart:checkout"));
        self.send(events).await;
        self.bot
            .store()
            .users
            .read(|u| u[&user_id].awaiting_payment_order_id)
            .await
            .expect("order linked to user")
    }

    async fn pending_plan_key(&self, user_id: UserId) -> String {
        self.chat
            .messages_to(user_id)
            .await
            .iter()
            .rev()
            .filter_map(OutboundMessage::keyboard)
            .flat_map(|k| k.callbacks().map(str::to_string).collect::<Vec<_>>())
            .find_map(|data| data.strip_prefix("plan:apply:").map(str::to_string))
            .expect("plan controls sent")
    }
}

#[tokio::test]
async fn checkout_snapshots_items_and_total() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[1, 2]).await;

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.total, 150);
    assert_eq!(order.items.len(), 2);
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert!(h.bot.store().users.read(|u| u[&BUYER].cart.is_empty()).await);
    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 1);

    h.bot
        .engine()
        .run_batch(
            ADMIN,
            &[ActionEnvelope {
                action_type: "change_price".to_string(),
                params: serde_json::json!({"id": 1, "price": 999}),
            }],
        )
        .await;
    assert_eq!(h.bot.orders().find(order_id).await.unwrap().total, 150);
}

#[tokio::test]
async fn empty_cart_checkout_creates_nothing() {
    let h = harness(&[]).await;
    h.send(vec![button(BUYER, "cart:checkout")]).await;

    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 0);
    assert_eq!(h.last_text(BUYER).await, "Your cart is empty.");
    assert!(matches!(
        h.bot.orders().create(BUYER).await,
        Err(EngineError::EmptyCart)
    ));
    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 0);
}

#[tokio::test]
async fn photo_without_pending_order_is_refused() {
    let h = harness(&[]).await;
    h.send(vec![photo(BUYER, "receipt-1")]).await;

    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 0);
    assert!(h.last_text(BUYER).await.starts_with("There is no order waiting"));
    assert!(matches!(
        h.bot.orders().attach_evidence(BUYER, "receipt-2").await,
        Err(EngineError::NoLinkedOrder)
    ));
}

#[tokio::test]
async fn payment_photo_reaches_every_admin_with_controls() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[4]).await;
    h.send(vec![photo(BUYER, "receipt-1")]).await;

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingCheck);
    assert_eq!(order.payment_evidence.as_deref(), Some("receipt-1"));

    for admin in [ADMIN, OTHER_ADMIN] {
        let messages = h.chat.messages_to(admin).await;
        let alert = messages
            .iter()
            .find(|m| matches!(m, OutboundMessage::Photo { .. }))
            .expect("photo alert");
        let callbacks: Vec<&str> = alert.keyboard().unwrap().callbacks().collect();
        assert!(callbacks.contains(&format!("order:accept:{order_id}").as_str()));
    }

    // the link is consumed; a second photo has nothing to attach to
    assert!(matches!(
        h.bot.orders().attach_evidence(BUYER, "receipt-2").await,
        Err(EngineError::NoLinkedOrder)
    ));
}

#[tokio::test]
async fn photo_after_rejection_keeps_order_rejected() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[1]).await;
    h.bot.orders().reject(order_id, "no payment", ADMIN).await.unwrap();

    h.send(vec![photo(BUYER, "receipt-late")]).await;

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(order.payment_evidence.is_none());
    assert!(h.last_text(BUYER).await.starts_with("There is no order waiting"));
    assert_eq!(
        h.bot
            .store()
            .users
            .read(|u| u[&BUYER].awaiting_payment_order_id)
            .await,
        None
    );
    for admin in [ADMIN, OTHER_ADMIN] {
        assert!(!h
            .chat
            .messages_to(admin)
            .await
            .iter()
            .any(|m| matches!(m, OutboundMessage::Photo { .. })));
    }
}

#[tokio::test]
async fn photo_for_vanished_order_clears_the_link() {
    let h = harness(&[]).await;
    h.checkout(BUYER, &[1]).await;
    h.bot.orders().clear_all(ADMIN).await.unwrap();

    let linked = h.bot.store().users.read(|u| u[&BUYER].awaiting_payment_order_id).await;
    assert!(matches!(
        h.bot.orders().attach_evidence(BUYER, "receipt-1").await,
        Err(EngineError::OrderNotFound(id)) if Some(id) == linked
    ));
    assert_eq!(
        h.bot.store().users.read(|u| u[&BUYER].awaiting_payment_order_id).await,
        None
    );
    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 0);

    h.checkout(BUYER, &[2]).await;
    h.bot.orders().clear_all(ADMIN).await.unwrap();
    h.send(vec![photo(BUYER, "receipt-2")]).await;

    assert!(h.last_text(BUYER).await.contains("no longer exists"));
    assert_eq!(
        h.bot.store().users.read(|u| u[&BUYER].awaiting_payment_order_id).await,
        None
    );
    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 0);
}

#[tokio::test]
async fn admins_get_text_alert_when_photo_send_fails() {
    let h = harness(&[]).await;
    h.chat.refuse_photos();
    let order_id = h.checkout(BUYER, &[4]).await;
    h.send(vec![photo(BUYER, "receipt-1")]).await;

    assert_eq!(
        h.bot.orders().find(order_id).await.unwrap().status,
        OrderStatus::AwaitingCheck
    );
    for admin in [ADMIN, OTHER_ADMIN] {
        let messages = h.chat.messages_to(admin).await;
        let alert = messages
            .iter()
            .find(|m| {
                matches!(m, OutboundMessage::Text { .. })
                    && m.text().is_some_and(|t| t.contains("Payment photo received"))
            })
            .expect("text alert");
        let callbacks: Vec<&str> = alert.keyboard().unwrap().callbacks().collect();
        assert!(callbacks.contains(&format!("order:verify:{order_id}").as_str()));
    }
}

#[tokio::test]
async fn second_rejection_overwrites_reason() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[1]).await;

    h.bot.orders().reject(order_id, "blurry photo", ADMIN).await.unwrap();
    h.bot.orders().reject(order_id, "wrong amount", ADMIN).await.unwrap();

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.reject_reason.as_deref(), Some("wrong amount"));
    assert!(h.last_text(BUYER).await.contains("wrong amount"));
    assert!(matches!(
        h.bot.orders().reject(404, "x", ADMIN).await,
        Err(EngineError::OrderNotFound(404))
    ));
}

#[tokio::test]
async fn rejected_buyer_can_dispute_and_admin_reply() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[1]).await;
    h.send(vec![
        button(ADMIN, &format!("order:reject:{order_id}")),
        text(ADMIN, "amount does not match"),
        button(BUYER, &format!("dispute:{order_id}")),
        text(BUYER, "I paid the full amount"),
    ])
    .await;

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.reject_reason.as_deref(), Some("amount does not match"));
    assert!(h
        .chat
        .texts_to(OTHER_ADMIN)
        .await
        .iter()
        .any(|t| t.contains("I paid the full amount")));

    h.send(vec![
        button(OTHER_ADMIN, &format!("dispute_reply:{order_id}:{BUYER}")),
        text(OTHER_ADMIN, "Checking again"),
    ])
    .await;
    assert!(h.last_text(BUYER).await.contains("Checking again"));
}

#[tokio::test]
async fn cancel_at_any_step_applies_nothing() {
    let inputs = ["Saber", "melee", "weapon", "120"];
    for steps in 0..=inputs.len() {
        let h = harness(&[]).await;
        let mut events = vec![button(ADMIN, "admin:add_product")];
        events.extend(inputs[..steps].iter().map(|i| text(ADMIN, i)));
        events.push(text(ADMIN, "CANCEL"));
        h.send(events).await;

        assert_eq!(h.bot.sessions().current(ADMIN).await, None);
        assert_eq!(h.bot.store().products.read(|p| p.len()).await, 4);
        assert_eq!(h.last_text(ADMIN).await, "Cancelled.");
    }
}

#[tokio::test]
async fn add_product_dialog_reprompts_without_losing_progress() {
    let h = harness(&[]).await;
    h.send(vec![
        button(ADMIN, "admin:add_product"),
        text(ADMIN, "S"),
        text(ADMIN, "Saber"),
        text(ADMIN, "melee"),
        text(ADMIN, "shield"),
        text(ADMIN, "weapon"),
        text(ADMIN, "-5"),
        text(ADMIN, "120"),
    ])
    .await;
    let (_, session) = h.bot.sessions().current(ADMIN).await.unwrap();
    assert_eq!(session.operation(), "add_product");
    assert_eq!(session.step(), 4);

    h.send(vec![text(ADMIN, "Sharp blade")]).await;
    assert_eq!(h.bot.sessions().current(ADMIN).await, None);
    let created = h
        .bot
        .store()
        .products
        .read(|p| p.iter().find(|p| p.title == "Saber").cloned())
        .await
        .unwrap();
    assert_eq!(created.id, 5);
    assert_eq!(created.kind, ProductKind::Weapon);
    assert_eq!(created.price, 120);
    assert_eq!(created.description, "Sharp blade");
}

#[tokio::test]
async fn delete_is_scoped_to_catalog_family() {
    let h = harness(&[]).await;
    h.send(vec![button(ADMIN, "admin:delete:goods"), text(ADMIN, "4")])
        .await;
    assert!(h.last_text(ADMIN).await.contains("is not weapon/armor"));
    assert!(h.bot.sessions().current(ADMIN).await.is_some());

    h.send(vec![text(ADMIN, "3")]).await;
    assert_eq!(h.bot.sessions().current(ADMIN).await, None);
    assert!(h.bot.store().products.read(|p| p.iter().all(|p| p.id != 3)).await);
    assert_eq!(h.bot.store().products.read(|p| p.len()).await, 3);
}

#[tokio::test]
async fn buyer_cannot_open_admin_dialogs() {
    let h = harness(&[]).await;
    h.send(vec![button(BUYER, "admin:add_product")]).await;
    assert_eq!(h.bot.sessions().current(BUYER).await, None);
    assert!(h.chat.texts_to(BUYER).await.is_empty());
}

#[tokio::test]
async fn password_login_grants_admin() {
    let h = harness(&[]).await;
    h.send(vec![text(BUYER, "/add"), text(BUYER, "letmein")]).await;
    assert!(h.last_text(BUYER).await.starts_with("Wrong password"));

    h.send(vec![text(BUYER, "1234")]).await;
    assert!(h.bot.store().users.read(|u| u[&BUYER].is_admin).await);
    assert_eq!(h.bot.sessions().current(BUYER).await, None);
}

const STATS_PLAN: &str = r#"{"summary":"show stats","risk":"low","actions":[{"type":"get_stats","params":{}}]}"#;

#[tokio::test]
async fn only_the_proposer_can_confirm_a_plan() {
    let h = harness(&[STATS_PLAN]).await;
    h.send(vec![
        button(ADMIN, "admin:operator"),
        text(ADMIN, "show me the stats"),
    ])
    .await;
    let key = h.pending_plan_key(ADMIN).await;

    h.send(vec![button(OTHER_ADMIN, &format!("plan:apply:{key}"))])
        .await;
    assert!(h.last_text(OTHER_ADMIN).await.contains("Only the admin who requested"));
    assert!(h.bot.plans().is_pending(&key).await);

    h.send(vec![button(OTHER_ADMIN, &format!("plan:deny:{key}"))])
        .await;
    assert!(h.bot.plans().is_pending(&key).await);

    h.send(vec![button(ADMIN, &format!("plan:apply:{key}"))]).await;
    assert!(!h.bot.plans().is_pending(&key).await);
    assert!(h.last_text(ADMIN).await.contains("get_stats"));

    h.send(vec![button(ADMIN, &format!("plan:apply:{key}"))]).await;
    assert!(h.last_text(ADMIN).await.contains("stale"));
}

#[tokio::test]
async fn negative_price_fails_alone_in_a_batch() {
    let plan = r#"{"summary":"reprice and set phone","risk":"medium","actions":[
        {"type":"change_price","params":{"id":3,"price":-5}},
        {"type":"set_payment_phone","params":{"phone":"+99361000000"}}
    ]}"#;
    let h = harness(&[plan]).await;
    h.send(vec![
        button(ADMIN, "admin:operator"),
        text(ADMIN, "increase price of item 3 to -5 and set the phone"),
    ])
    .await;
    let key = h.pending_plan_key(ADMIN).await;
    h.send(vec![button(ADMIN, &format!("plan:apply:{key}"))]).await;

    let report = h.last_text(ADMIN).await;
    assert!(report.contains("price must be non-negative"));
    assert_eq!(
        h.bot
            .store()
            .products
            .read(|p| p.iter().find(|p| p.id == 3).map(|p| p.price))
            .await,
        Some(40)
    );
    assert_eq!(
        h.bot.store().settings.read(|s| s.payment_phone.clone()).await,
        "+99361000000"
    );
}

#[tokio::test]
async fn batch_reports_each_action() {
    let h = harness(&[]).await;
    let envelopes: Vec<ActionEnvelope> = serde_json::from_value(serde_json::json!([
        {"type": "drop_tables", "params": {}},
        {"type": "delete_product", "params": {"id": 4}},
        {"type": "delete_escort", "params": {"id": 4}},
    ]))
    .unwrap();
    let report = h.bot.engine().run_batch(ADMIN, &envelopes).await;

    let flags: Vec<bool> = report.outcomes.iter().map(|o| o.ok).collect();
    assert_eq!(flags, vec![false, false, true]);
    assert_eq!(report.outcomes[0].message, "unknown action: drop_tables");
    assert!(!report.restart);
}

#[tokio::test]
async fn restart_runs_once_after_the_batch() {
    let plan = r#"{"summary":"restart","risk":"high","actions":[
        {"type":"restart_bot","params":{}},
        {"type":"get_stats","params":{}},
        {"type":"restart_bot","params":{}}
    ]}"#;
    let h = harness(&[plan]).await;
    h.send(vec![
        button(ADMIN, "admin:operator"),
        text(ADMIN, "restart please"),
    ])
    .await;
    let key = h.pending_plan_key(ADMIN).await;
    assert!(!h.bot.restart_signal().is_requested());

    h.send(vec![button(ADMIN, &format!("plan:apply:{key}"))]).await;
    assert_eq!(h.bot.restart_signal().request_count(), 1);
    assert!(h.bot.restart_signal().is_requested());
}

#[tokio::test]
async fn prose_from_the_model_produces_no_plan() {
    let h = harness(&["Sure, I raised the price."]).await;
    h.send(vec![
        button(ADMIN, "admin:operator"),
        text(ADMIN, "raise item 1"),
    ])
    .await;
    assert!(h.last_text(ADMIN).await.starts_with("No plan produced"));
    assert_eq!(h.bot.plans().pending_count().await, 0);
}

#[tokio::test]
async fn broadcast_counts_only_delivered_messages() {
    let h = harness(&[]).await;
    h.send(vec![text(BUYER, "/start"), text(11, "/start")]).await;
    h.chat.make_unreachable(11).await;

    h.send(vec![button(ADMIN, "admin:broadcast"), text(ADMIN, "Sale today")])
        .await;
    assert!(h.last_text(ADMIN).await.contains("broadcast sent to 3 of 4"));
    assert_eq!(h.last_text(BUYER).await, "Sale today");
}

#[tokio::test]
async fn events_inside_cooldown_change_nothing() {
    let h = harness_with(3_000, &[], None).await;
    h.bot
        .store()
        .users
        .update(|u| u.entry(BUYER).or_default().cart.push(1))
        .await
        .unwrap();

    assert!(h.bot.handle(button(BUYER, "cart:checkout")).await);
    assert!(!h.bot.handle(button(BUYER, "cart:checkout")).await);

    assert_eq!(h.bot.store().orders.read(|o| o.len()).await, 1);
    let texts = h.chat.texts_to(BUYER).await;
    assert_eq!(texts.len(), 2);
    assert!(texts[0].contains("Order #1"));
    assert!(texts[1].starts_with("⏳ Too fast"));
}

#[tokio::test]
async fn failed_vision_call_stores_synthetic_verdict() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[2]).await;
    h.send(vec![
        photo(BUYER, "receipt-1"),
        button(ADMIN, &format!("order:verify:{order_id}")),
    ])
    .await;

    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::AwaitingCheck);
    let verdict = order.last_verdict.unwrap();
    assert!(verdict.contains("insufficient data"));
    assert!(order.last_verdict_at.is_some());
}

#[tokio::test]
async fn unresolvable_photo_stores_synthetic_verdict() {
    let h = harness_with(0, &[], Some("```bash\nStatus: confirmed\n```")).await;
    let order_id = h.checkout(BUYER, &[2]).await;
    h.send(vec![photo(BUYER, "receipt-1")]).await;
    h.chat.lose_files();

    let verdict = h.bot.orders().verify(order_id, false).await.unwrap();
    assert!(verdict.contains("insufficient data"));
    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.last_verdict.as_deref(), Some(verdict.as_str()));
    assert_eq!(order.status, OrderStatus::AwaitingCheck);
}

#[tokio::test]
async fn vision_verdict_is_trimmed_to_its_block() {
    let reply = "Here you go:\n```bash\nStatus: confirmed\nConfidence: high\n```\nThanks";
    let h = harness_with(0, &[], Some(reply)).await;
    let order_id = h.checkout(BUYER, &[2]).await;
    h.send(vec![photo(BUYER, "receipt-1")]).await;

    let verdict = h.bot.orders().verify(order_id, true).await.unwrap();
    assert_eq!(verdict, "Status: confirmed\nConfidence: high");
}

#[tokio::test]
async fn accept_requires_payment_evidence() {
    let h = harness(&[]).await;
    let order_id = h.checkout(BUYER, &[1]).await;

    h.send(vec![button(ADMIN, &format!("order:accept:{order_id}"))])
        .await;
    assert_eq!(
        h.bot.orders().find(order_id).await.unwrap().status,
        OrderStatus::PendingPayment
    );

    h.send(vec![
        photo(BUYER, "receipt-1"),
        button(ADMIN, &format!("order:accept:{order_id}")),
    ])
    .await;
    let order = h.bot.orders().find(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);
    assert!(order.accepted_at.is_some());
}
