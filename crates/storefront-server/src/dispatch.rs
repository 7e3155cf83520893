use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use storefront_config::Config;
use storefront_contracts::{
    Button, CatalogFamily, ChatId, InboundEvent, InboundPayload, Keyboard, OrderId, Product,
    ProductId, User, UserId,
};
use storefront_kernel::text::escape_html;
use storefront_kernel::{validate, Action, GateDecision};

use crate::actions::ActionEngine;
use crate::completion::CompletionService;
use crate::cooldown::CooldownGuard;
use crate::error::EngineError;
use crate::journal::Journal;
use crate::orders::OrderDesk;
use crate::plans::PlanDesk;
use crate::sessions::{DescriptionStep, PriceStep, ProductStep, Session, SessionRegistry};
use crate::store::Store;
use crate::transport::ChatTransport;
use crate::ui::{self, AdminCommand, ButtonCommand, OrderControl};
use crate::RestartSignal;

const ORDER_LIST_LIMIT: usize = 10;

/// Who sent the event being handled, resolved once per event.
#[derive(Debug, Clone)]
pub(crate) struct EventContext {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub username: String,
    pub is_admin: bool,
    pub callback_id: Option<String>,
    pub message_id: Option<i64>,
}

/// Single entry point for inbound chat events. Owns every engine component.
pub struct Dispatcher {
    pub(crate) store: Arc<Store>,
    pub(crate) journal: Arc<Journal>,
    pub(crate) transport: Arc<dyn ChatTransport>,
    pub(crate) cooldown: CooldownGuard,
    pub(crate) sessions: SessionRegistry,
    pub(crate) orders: Arc<OrderDesk>,
    pub(crate) plans: PlanDesk,
    pub(crate) engine: ActionEngine,
    pub(crate) restart: RestartSignal,
    shop_name: String,
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        store: Arc<Store>,
        transport: Arc<dyn ChatTransport>,
        completion: Arc<dyn CompletionService>,
        restart: RestartSignal,
    ) -> Self {
        let journal = Arc::new(Journal::new(store.clone(), cfg.journal.max_entries));
        let orders = Arc::new(OrderDesk::new(
            store.clone(),
            transport.clone(),
            completion.clone(),
            journal.clone(),
            cfg.shop.currency.clone(),
        ));
        let plans = PlanDesk::new(
            store.clone(),
            completion,
            journal.clone(),
            cfg.plans.ttl_ms,
            cfg.plans.max_pending,
            cfg.completion.context_max_chars,
            cfg.shop.name.clone(),
            cfg.shop.currency.clone(),
        );
        let engine = ActionEngine::new(
            store.clone(),
            transport.clone(),
            journal.clone(),
            orders.clone(),
        );
        Self {
            store,
            journal,
            transport,
            cooldown: CooldownGuard::new(cfg.gate.cooldown_ms),
            sessions: SessionRegistry::new(),
            orders,
            plans,
            engine,
            restart,
            shop_name: cfg.shop.name.clone(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn orders(&self) -> &OrderDesk {
        &self.orders
    }

    pub fn plans(&self) -> &PlanDesk {
        &self.plans
    }

    pub fn engine(&self) -> &ActionEngine {
        &self.engine
    }

    pub fn restart_signal(&self) -> &RestartSignal {
        &self.restart
    }

    /// Runs one event. Returns false when the cooldown dropped it. Handler
    /// errors end here: they are journaled and the user gets a generic notice.
    pub async fn handle(&self, event: InboundEvent) -> bool {
        if let GateDecision::Deny { retry_in } =
            self.cooldown.try_accept(event.user_id, Utc::now()).await
        {
            let seconds = ((retry_in.num_milliseconds() + 999) / 1000).max(1);
            tracing::debug!(user_id = event.user_id, seconds, "event dropped by cooldown");
            let notice = format!("⏳ Too fast. Try again in {seconds} s.");
            match &event.payload {
                InboundPayload::Button {
                    callback_id: Some(id),
                    ..
                } => {
                    if let Err(err) = self.transport.answer_button(id, Some(&notice), false).await {
                        tracing::debug!(error = %err, "cooldown notice not delivered");
                    }
                }
                _ => self.say(event.chat_id, &notice, None).await,
            }
            return false;
        }

        tracing::debug!(
            user_id = event.user_id,
            kind = event.payload.kind(),
            "event accepted"
        );
        if let Err(err) = self.route(&event).await {
            self.fail(&event, err).await;
        }
        true
    }

    async fn fail(&self, event: &InboundEvent, err: EngineError) {
        if matches!(err, EngineError::Unauthorized) {
            tracing::warn!(user_id = event.user_id, "unauthorized request refused");
            self.say(event.chat_id, "⛔ Not allowed.", None).await;
            return;
        }
        self.journal
            .error(event.payload.kind(), &err, Some(event.user_id))
            .await;
        self.say(event.chat_id, ui::GENERIC_FAILURE, None).await;
    }

    async fn route(&self, event: &InboundEvent) -> Result<(), EngineError> {
        let ctx = self.context(event).await?;
        match &event.payload {
            InboundPayload::Text { text } => self.on_text(&ctx, text).await,
            InboundPayload::Photo { file_id } => self.on_photo(&ctx, file_id).await,
            InboundPayload::Button { data, .. } => self.on_button(&ctx, data).await,
        }
    }

    /// Registers first-time users and keeps the stored username current.
    async fn context(&self, event: &InboundEvent) -> Result<EventContext, EngineError> {
        let username = event.username.clone().unwrap_or_default();
        let (is_admin, is_new) = {
            let mut users = self.store.users.lock().await;
            let mut changed = false;
            let is_new = !users.contains_key(&event.user_id);
            let user = users.entry(event.user_id).or_insert_with(User::default);
            if is_new || (!username.is_empty() && user.username != username) {
                user.username = username.clone();
                changed = true;
            }
            let is_admin = user.is_admin;
            if changed {
                self.store.users.commit(&users).await?;
            }
            (is_admin, is_new)
        };
        if is_new {
            self.journal
                .record("user_registered", Some(event.user_id), json!({ "username": username }))
                .await;
        }

        let (callback_id, message_id) = match &event.payload {
            InboundPayload::Button {
                callback_id,
                message_id,
                ..
            } => (callback_id.clone(), *message_id),
            _ => (None, None),
        };
        Ok(EventContext {
            user_id: event.user_id,
            chat_id: event.chat_id,
            username,
            is_admin,
            callback_id,
            message_id,
        })
    }

    async fn on_text(&self, ctx: &EventContext, text: &str) -> Result<(), EngineError> {
        if let Some((generation, session)) = self.sessions.current(ctx.user_id).await {
            return self.continue_session(ctx, generation, session, text).await;
        }

        let command = text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();
        match command.as_str() {
            "/start" | "/menu" => self.welcome(ctx).await,
            "/add" => {
                if ctx.is_admin {
                    self.say(ctx.chat_id, "You are already an admin.", Some(&ui::admin_menu()))
                        .await;
                } else {
                    self.begin_session(ctx, Session::AdminLogin).await;
                }
            }
            "/admin" if ctx.is_admin => {
                self.say(ctx.chat_id, "🛠 Admin panel", Some(&ui::admin_menu()))
                    .await
            }
            _ if validate::is_cancel(text) => self.welcome(ctx).await,
            _ => {
                self.say(
                    ctx.chat_id,
                    "I did not understand that. Use the menu below.",
                    Some(&ui::main_menu(ctx.is_admin)),
                )
                .await
            }
        }
        Ok(())
    }

    async fn on_photo(&self, ctx: &EventContext, file_id: &str) -> Result<(), EngineError> {
        match self.orders.attach_evidence(ctx.user_id, file_id).await {
            Ok(order) => {
                self.say(
                    ctx.chat_id,
                    &format!(
                        "📨 Payment photo received for order #{}. An admin will check it soon.",
                        order.id
                    ),
                    Some(&ui::main_menu(ctx.is_admin)),
                )
                .await;
                Ok(())
            }
            Err(EngineError::NoLinkedOrder) => {
                self.say(
                    ctx.chat_id,
                    "There is no order waiting for payment. Check out your cart first.",
                    None,
                )
                .await;
                Ok(())
            }
            Err(EngineError::OrderNotFound(order_id)) => {
                self.say(
                    ctx.chat_id,
                    &format!("Order #{order_id} no longer exists. Please check out again."),
                    None,
                )
                .await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_button(&self, ctx: &EventContext, data: &str) -> Result<(), EngineError> {
        if let Some(id) = &ctx.callback_id {
            if let Err(err) = self.transport.answer_button(id, None, false).await {
                tracing::debug!(error = %err, "button acknowledgement failed");
            }
        }
        let Some(command) = ButtonCommand::parse(data) else {
            tracing::debug!(user_id = ctx.user_id, data, "unknown button payload");
            return Ok(());
        };
        if command.requires_admin() && !ctx.is_admin {
            tracing::warn!(user_id = ctx.user_id, data, "admin button pressed by non-admin");
            return Ok(());
        }

        match command {
            ButtonCommand::MainMenu => {
                self.sessions.cancel(ctx.user_id).await;
                self.welcome(ctx).await;
            }
            ButtonCommand::Shop => {
                self.say(ctx.chat_id, "Choose a section:", Some(&ui::shop_menu()))
                    .await
            }
            ButtonCommand::Catalog { kind, page } => {
                let products = self.store.products.snapshot().await;
                let (text, keyboard) =
                    ui::catalog_page(&products, kind, page, self.orders.currency());
                self.say(ctx.chat_id, &text, Some(&keyboard)).await;
            }
            ButtonCommand::Product(id) => match self.product(id).await {
                Some(product) => {
                    let (text, keyboard) = ui::product_card(&product, self.orders.currency());
                    self.say(ctx.chat_id, &text, Some(&keyboard)).await;
                }
                None => self.say(ctx.chat_id, "This item is no longer available.", None).await,
            },
            ButtonCommand::CartAdd(id) => match self.product(id).await {
                Some(product) => {
                    self.add_to_cart(ctx, product.id).await?;
                    let keyboard = Keyboard::new()
                        .button(Button::callback(
                            "🧺 Open cart",
                            ButtonCommand::CartOpen.data(),
                        ))
                        .button(Button::callback(
                            "⬅️ Back",
                            ButtonCommand::Catalog {
                                kind: product.kind,
                                page: 0,
                            }
                            .data(),
                        ));
                    self.say(
                        ctx.chat_id,
                        &format!("🧺 Added \"{}\" to your cart.", escape_html(&product.title)),
                        Some(&keyboard),
                    )
                    .await;
                }
                None => self.say(ctx.chat_id, "This item is no longer available.", None).await,
            },
            ButtonCommand::CartAddById(kind) => {
                self.begin_session(ctx, Session::AddToCart { kind }).await
            }
            ButtonCommand::CartOpen => {
                let items = self.cart_items(ctx.user_id).await;
                let (text, keyboard) = ui::cart_view(&items, self.orders.currency());
                self.say(ctx.chat_id, &text, Some(&keyboard)).await;
            }
            ButtonCommand::CartClear => {
                self.store
                    .users
                    .update(|users| {
                        if let Some(user) = users.get_mut(&ctx.user_id) {
                            user.cart.clear();
                        }
                    })
                    .await?;
                self.say(ctx.chat_id, "🗑 Cart cleared.", Some(&ui::main_menu(ctx.is_admin)))
                    .await;
            }
            ButtonCommand::Checkout => self.checkout(ctx).await?,
            ButtonCommand::PaymentInfo => {
                let phone = self.store.settings.read(|s| s.payment_phone.clone()).await;
                let text = if phone.is_empty() {
                    "Payment details are not set yet. Please contact support.".to_string()
                } else {
                    format!(
                        "💳 Pay by transfer to <b>{}</b>.\nAfter checkout, send a photo of the receipt here.",
                        escape_html(&phone)
                    )
                };
                self.say(ctx.chat_id, &text, Some(&ui::main_menu(ctx.is_admin)))
                    .await;
            }
            ButtonCommand::About => {
                let support = self.store.settings.read(|s| s.support_username.clone()).await;
                let mut text = format!("<b>{}</b>", escape_html(&self.shop_name));
                let mut keyboard = Keyboard::new();
                if !support.is_empty() {
                    text.push_str(&format!("\nSupport: @{}", escape_html(&support)));
                    keyboard = keyboard.button(Button::url(
                        "💬 Contact support",
                        format!("https://t.me/{support}"),
                    ));
                }
                let keyboard = keyboard.button(Button::callback(
                    validate::MAIN_MENU_LABEL,
                    ButtonCommand::MainMenu.data(),
                ));
                self.say(ctx.chat_id, &text, Some(&keyboard)).await;
            }
            ButtonCommand::Help => {
                self.say(
                    ctx.chat_id,
                    "1. Pick items in the shop and add them to your cart.\n\
                     2. Check out and pay the total to the payment phone.\n\
                     3. Send a photo of the receipt in this chat.\n\
                     Send cancel at any time to leave a dialog.",
                    Some(&ui::main_menu(ctx.is_admin)),
                )
                .await
            }
            ButtonCommand::Dispute(order_id) => {
                let owned = self
                    .orders
                    .find(order_id)
                    .await
                    .is_some_and(|o| o.user_id == ctx.user_id);
                if owned {
                    self.begin_session(ctx, Session::DisputeMessage { order_id })
                        .await;
                } else {
                    self.say(ctx.chat_id, "Order not found.", None).await;
                }
            }
            ButtonCommand::DisputeReply { order_id, user_id } => {
                self.begin_session(ctx, Session::DisputeReply { order_id, user_id })
                    .await
            }
            ButtonCommand::Admin(cmd) => self.on_admin(ctx, cmd).await?,
            ButtonCommand::Order(control, order_id) => {
                self.on_order_control(ctx, control, order_id).await?
            }
            ButtonCommand::PlanApply(key) => self.confirm_plan(ctx, &key).await?,
            ButtonCommand::PlanDeny(key) => self.deny_plan(ctx, &key).await?,
        }
        Ok(())
    }

    async fn on_admin(&self, ctx: &EventContext, cmd: AdminCommand) -> Result<(), EngineError> {
        match cmd {
            AdminCommand::Menu => {
                self.say(ctx.chat_id, "🛠 Admin panel", Some(&ui::admin_menu()))
                    .await
            }
            AdminCommand::Products | AdminCommand::Escorts => {
                let family = if cmd == AdminCommand::Products {
                    CatalogFamily::Goods
                } else {
                    CatalogFamily::Escort
                };
                let count = self
                    .store
                    .products
                    .read(|p| p.iter().filter(|p| family.contains(p.kind)).count())
                    .await;
                self.say(
                    ctx.chat_id,
                    &format!("{} items: {count}", family.label()),
                    Some(&ui::catalog_admin_menu(family)),
                )
                .await;
            }
            AdminCommand::Orders => {
                let orders = self
                    .store
                    .orders
                    .read(|orders| {
                        let skip = orders.len().saturating_sub(ORDER_LIST_LIMIT);
                        orders[skip..].to_vec()
                    })
                    .await;
                if orders.is_empty() {
                    self.say(ctx.chat_id, "No orders yet.", Some(&ui::admin_menu()))
                        .await;
                }
                for order in &orders {
                    self.say(
                        ctx.chat_id,
                        &ui::order_summary(order, self.orders.currency()),
                        Some(&ui::order_controls(order.id)),
                    )
                    .await;
                }
            }
            AdminCommand::Settings => {
                let settings = self.store.settings.snapshot().await;
                let text = format!(
                    "⚙️ Settings\nPayment phone: {}\nSupport: @{}",
                    escape_html(&settings.payment_phone),
                    escape_html(&settings.support_username)
                );
                self.say(ctx.chat_id, &text, Some(&ui::settings_menu())).await;
            }
            AdminCommand::Admins => {
                let admins = self.orders.admin_ids().await;
                let list: Vec<String> = admins.iter().map(|id| format!("• {id}")).collect();
                self.say(
                    ctx.chat_id,
                    &format!("👑 Admins\n{}", list.join("\n")),
                    Some(&ui::admins_menu()),
                )
                .await;
            }
            AdminCommand::Stats => {
                let stats = self.engine.stats().await;
                let body = serde_json::to_string_pretty(&stats).unwrap_or_default();
                self.say(
                    ctx.chat_id,
                    &format!("📊 <b>Stats</b>\n<pre>{}</pre>", escape_html(&body)),
                    Some(&ui::admin_menu()),
                )
                .await;
            }
            AdminCommand::Operator => self.begin_session(ctx, Session::Operator).await,
            AdminCommand::Broadcast => self.begin_session(ctx, Session::Broadcast).await,
            AdminCommand::Restart => {
                match self.engine.run(ctx.user_id, Action::RestartBot).await {
                    Ok(report) if report.restart => {
                        self.say(ctx.chat_id, "♻️ Restarting...", None).await;
                        self.restart.request();
                    }
                    Ok(report) => self.say(ctx.chat_id, &report.message, None).await,
                    Err(err) => self.say(ctx.chat_id, &err.to_string(), None).await,
                }
            }
            AdminCommand::ClearOrders => {
                let removed = self.orders.clear_all(ctx.user_id).await?;
                self.say(
                    ctx.chat_id,
                    &format!("🧹 Removed {removed} orders."),
                    Some(&ui::admin_menu()),
                )
                .await;
            }
            AdminCommand::Logs(window) => {
                let entries = self
                    .journal
                    .tail(window.duration(), Utc::now(), ui::LOG_TAIL_LIMIT)
                    .await;
                self.say(ctx.chat_id, &ui::log_lines(&entries), Some(&ui::admin_menu()))
                    .await;
            }
            AdminCommand::AddProduct => {
                self.begin_session(ctx, Session::AddProduct(ProductStep::Title))
                    .await
            }
            AdminCommand::AddEscort => {
                self.begin_session(ctx, Session::AddEscort(ProductStep::Title))
                    .await
            }
            AdminCommand::Delete(family) => {
                self.begin_session(ctx, Session::DeleteItem { family }).await
            }
            AdminCommand::Price(family) => {
                self.begin_session(
                    ctx,
                    Session::ChangePrice {
                        family,
                        step: PriceStep::Identify,
                    },
                )
                .await
            }
            AdminCommand::Describe => {
                self.begin_session(ctx, Session::ChangeDescription(DescriptionStep::Identify))
                    .await
            }
            AdminCommand::Password => self.begin_session(ctx, Session::ChangePassword).await,
            AdminCommand::Phone => self.begin_session(ctx, Session::ChangePaymentPhone).await,
            AdminCommand::Support => {
                self.begin_session(ctx, Session::ChangeSupportUsername)
                    .await
            }
            AdminCommand::Grant => self.begin_session(ctx, Session::GrantAdmin).await,
            AdminCommand::Revoke => self.begin_session(ctx, Session::RevokeAdmin).await,
        }
        Ok(())
    }

    async fn on_order_control(
        &self,
        ctx: &EventContext,
        control: OrderControl,
        order_id: OrderId,
    ) -> Result<(), EngineError> {
        match control {
            OrderControl::Verify | OrderControl::DeepVerify => {
                let deep = control == OrderControl::DeepVerify;
                self.say(
                    ctx.chat_id,
                    &format!("🔍 Checking payment for order #{order_id}..."),
                    None,
                )
                .await;
                match self.orders.verify(order_id, deep).await {
                    Ok(verdict) => {
                        self.say(
                            ctx.chat_id,
                            &format!(
                                "<b>Verdict for order #{order_id}</b>\n<pre>{}</pre>",
                                escape_html(&verdict)
                            ),
                            Some(&ui::order_controls(order_id)),
                        )
                        .await
                    }
                    Err(EngineError::OrderNotFound(_)) => {
                        self.say(ctx.chat_id, "Order not found.", None).await
                    }
                    Err(EngineError::Validation(msg)) => self.say(ctx.chat_id, &msg, None).await,
                    Err(err) => return Err(err),
                }
            }
            OrderControl::Message => {
                self.begin_session(ctx, Session::OrderMessage { order_id })
                    .await
            }
            OrderControl::Reject => {
                self.begin_session(ctx, Session::RejectReason { order_id })
                    .await
            }
            OrderControl::Accept => match self.orders.accept(order_id, ctx.user_id).await {
                Ok(_) => {
                    self.drop_controls(ctx).await;
                    self.say(ctx.chat_id, &format!("✅ Order #{order_id} accepted."), None)
                        .await;
                }
                Err(EngineError::OrderNotFound(_)) => {
                    self.say(ctx.chat_id, "Order not found.", None).await
                }
                Err(EngineError::Validation(msg)) => self.say(ctx.chat_id, &msg, None).await,
                Err(err) => return Err(err),
            },
        }
        Ok(())
    }

    async fn confirm_plan(&self, ctx: &EventContext, key: &str) -> Result<(), EngineError> {
        let plan = match self.plans.take_for_confirm(key, ctx.user_id, Utc::now()).await {
            Ok(plan) => plan,
            Err(EngineError::NotFound(_)) => {
                self.say(ctx.chat_id, "⌛ This plan is stale or was already handled.", None)
                    .await;
                return Ok(());
            }
            Err(EngineError::Unauthorized) => {
                self.say(
                    ctx.chat_id,
                    "⛔ Only the admin who requested this plan can act on it.",
                    None,
                )
                .await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.drop_controls(ctx).await;

        let report = self.engine.run_batch(ctx.user_id, &plan.actions).await;
        self.say(ctx.chat_id, &ui::outcomes_message(&report.outcomes), None)
            .await;
        if report.restart {
            self.say(ctx.chat_id, "♻️ Restarting...", None).await;
            self.restart.request();
        }
        Ok(())
    }

    async fn deny_plan(&self, ctx: &EventContext, key: &str) -> Result<(), EngineError> {
        match self.plans.deny(key, ctx.user_id, Utc::now()).await {
            Ok(()) => {
                self.drop_controls(ctx).await;
                self.say(ctx.chat_id, "🚫 Plan discarded.", None).await;
            }
            Err(EngineError::NotFound(_)) => {
                self.say(ctx.chat_id, "⌛ This plan is stale or was already handled.", None)
                    .await
            }
            Err(EngineError::Unauthorized) => {
                self.say(
                    ctx.chat_id,
                    "⛔ Only the admin who requested this plan can act on it.",
                    None,
                )
                .await
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn checkout(&self, ctx: &EventContext) -> Result<(), EngineError> {
        match self.orders.create(ctx.user_id).await {
            Ok(order) => {
                let phone = self.store.settings.read(|s| s.payment_phone.clone()).await;
                let mut text = ui::order_summary(&order, self.orders.currency());
                if !phone.is_empty() {
                    text.push_str(&format!(
                        "\n\n💳 Transfer {} {} to <b>{}</b> and send a photo of the receipt here.",
                        order.total,
                        self.orders.currency(),
                        escape_html(&phone)
                    ));
                } else {
                    text.push_str("\n\nSend a photo of the payment receipt here.");
                }
                self.say(ctx.chat_id, &text, None).await;
                Ok(())
            }
            Err(EngineError::EmptyCart) => {
                self.say(
                    ctx.chat_id,
                    "Your cart is empty.",
                    Some(&ui::main_menu(ctx.is_admin)),
                )
                .await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn welcome(&self, ctx: &EventContext) {
        let text = format!("Welcome to {}! Choose a section:", escape_html(&self.shop_name));
        self.say(ctx.chat_id, &text, Some(&ui::main_menu(ctx.is_admin)))
            .await;
    }

    async fn product(&self, id: ProductId) -> Option<Product> {
        self.store
            .products
            .read(|p| p.iter().find(|p| p.id == id).cloned())
            .await
    }

    async fn cart_items(&self, user_id: UserId) -> Vec<Product> {
        let cart = self
            .store
            .users
            .read(|users| users.get(&user_id).map(|u| u.cart.clone()).unwrap_or_default())
            .await;
        self.store
            .products
            .read(|products| {
                cart.iter()
                    .filter_map(|id| products.iter().find(|p| p.id == *id).cloned())
                    .collect()
            })
            .await
    }

    pub(crate) async fn add_to_cart(
        &self,
        ctx: &EventContext,
        product_id: ProductId,
    ) -> Result<(), EngineError> {
        self.store
            .users
            .update(|users| {
                users
                    .entry(ctx.user_id)
                    .or_insert_with(User::default)
                    .cart
                    .push(product_id)
            })
            .await?;
        self.journal
            .record("cart_add", Some(ctx.user_id), json!({ "product_id": product_id }))
            .await;
        Ok(())
    }

    pub(crate) async fn is_admin(&self, user_id: UserId) -> bool {
        self.store
            .users
            .read(|users| users.get(&user_id).is_some_and(|u| u.is_admin))
            .await
    }

    /// Delivery failures are logged and otherwise ignored.
    pub(crate) async fn say(&self, chat_id: ChatId, text: &str, keyboard: Option<&Keyboard>) {
        if let Err(err) = self.transport.send_text(chat_id, text, keyboard).await {
            tracing::warn!(chat_id, error = %err, "message not delivered");
        }
    }

    async fn drop_controls(&self, ctx: &EventContext) {
        if let Some(message_id) = ctx.message_id {
            if let Err(err) = self
                .transport
                .edit_controls(ctx.chat_id, message_id, None)
                .await
            {
                tracing::debug!(error = %err, "could not remove controls");
            }
        }
    }
}
