//! Multi-step dialogs. Each operation is a typed state that carries what the
//! earlier steps collected; only the terminal step touches the store.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use storefront_contracts::{
    CatalogFamily, Keyboard, OrderId, ProductId, ProductKind, User, UserId,
};
use storefront_kernel::text::escape_html;
use storefront_kernel::{validate, Action, ActionError, NewProduct};
use tokio::sync::Mutex;

use crate::dispatch::{Dispatcher, EventContext};
use crate::error::EngineError;
use crate::plans::Proposal;
use crate::ui;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductStep {
    Title,
    Category {
        title: String,
    },
    Kind {
        title: String,
        category: String,
    },
    Price {
        title: String,
        category: String,
        kind: ProductKind,
    },
    Description {
        title: String,
        category: String,
        kind: ProductKind,
        price: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceStep {
    Identify,
    Price { id: ProductId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionStep {
    Identify,
    Text { id: ProductId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    AdminLogin,
    Broadcast,
    AddToCart { kind: Option<ProductKind> },
    DisputeMessage { order_id: OrderId },
    DisputeReply { order_id: OrderId, user_id: UserId },
    ChangePassword,
    ChangePaymentPhone,
    ChangeSupportUsername,
    GrantAdmin,
    RevokeAdmin,
    AddProduct(ProductStep),
    AddEscort(ProductStep),
    DeleteItem { family: CatalogFamily },
    ChangePrice { family: CatalogFamily, step: PriceStep },
    ChangeDescription(DescriptionStep),
    RejectReason { order_id: OrderId },
    OrderMessage { order_id: OrderId },
    Operator,
}

pub const SESSION_OPERATIONS: &[&str] = &[
    "admin_login",
    "broadcast",
    "add_to_cart",
    "dispute_message",
    "dispute_reply",
    "change_password",
    "change_payment_phone",
    "change_support_username",
    "grant_admin",
    "revoke_admin",
    "add_product",
    "add_escort",
    "delete_item",
    "change_price",
    "change_description",
    "reject_reason",
    "order_message",
    "operator",
];

impl Session {
    pub fn operation(&self) -> &'static str {
        match self {
            Session::AdminLogin => "admin_login",
            Session::Broadcast => "broadcast",
            Session::AddToCart { .. } => "add_to_cart",
            Session::DisputeMessage { .. } => "dispute_message",
            Session::DisputeReply { .. } => "dispute_reply",
            Session::ChangePassword => "change_password",
            Session::ChangePaymentPhone => "change_payment_phone",
            Session::ChangeSupportUsername => "change_support_username",
            Session::GrantAdmin => "grant_admin",
            Session::RevokeAdmin => "revoke_admin",
            Session::AddProduct(_) => "add_product",
            Session::AddEscort(_) => "add_escort",
            Session::DeleteItem { .. } => "delete_item",
            Session::ChangePrice { .. } => "change_price",
            Session::ChangeDescription(_) => "change_description",
            Session::RejectReason { .. } => "reject_reason",
            Session::OrderMessage { .. } => "order_message",
            Session::Operator => "operator",
        }
    }

    pub fn step(&self) -> usize {
        match self {
            Session::AddProduct(step) | Session::AddEscort(step) => match step {
                ProductStep::Title => 0,
                ProductStep::Category { .. } => 1,
                ProductStep::Kind { .. } => 2,
                ProductStep::Price { .. } => 3,
                ProductStep::Description { .. } => 4,
            },
            Session::ChangePrice {
                step: PriceStep::Price { .. },
                ..
            } => 1,
            Session::ChangeDescription(DescriptionStep::Text { .. }) => 1,
            _ => 0,
        }
    }

    pub fn requires_admin(&self) -> bool {
        !matches!(
            self,
            Session::AdminLogin | Session::AddToCart { .. } | Session::DisputeMessage { .. }
        )
    }

    pub fn opening_prompt(&self) -> String {
        match self {
            Session::AdminLogin => "Enter the admin password:".to_string(),
            Session::Broadcast => "Send the text to broadcast to every user:".to_string(),
            Session::AddToCart { .. } => "Send the item ID to add to your cart:".to_string(),
            Session::DisputeMessage { order_id } => {
                format!("Describe the problem with order #{order_id}:")
            }
            Session::DisputeReply { order_id, .. } => {
                format!("Write your reply to the customer (order #{order_id}):")
            }
            Session::ChangePassword => "Send the new admin password:".to_string(),
            Session::ChangePaymentPhone => "Send the new payment phone:".to_string(),
            Session::ChangeSupportUsername => {
                "Send the support username, e.g. @helpdesk:".to_string()
            }
            Session::GrantAdmin => "Send the user ID to make admin:".to_string(),
            Session::RevokeAdmin => "Send the admin's user ID to revoke:".to_string(),
            Session::AddProduct(_) => "New product. Send the title:".to_string(),
            Session::AddEscort(_) => "New escort. Send the title:".to_string(),
            Session::DeleteItem { family } => {
                format!("Send the ID of the {} item to delete:", family.label())
            }
            Session::ChangePrice { family, .. } => {
                format!("Send the ID of the {} item to reprice:", family.label())
            }
            Session::ChangeDescription(_) => "Send the product ID:".to_string(),
            Session::RejectReason { order_id } => {
                format!("Send the reject reason for order #{order_id}:")
            }
            Session::OrderMessage { order_id } => {
                format!("Send the message for the customer of order #{order_id}:")
            }
            Session::Operator => {
                "🤖 AI operator. Describe what should change; send cancel to leave.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductTransition {
    Retry(String),
    Next(ProductStep, String),
    Done(NewProduct),
}

/// Transition table for the add-product and add-escort dialogs. Escorts skip
/// the kind step.
pub fn advance_product(step: ProductStep, family: CatalogFamily, input: &str) -> ProductTransition {
    use ProductTransition::{Done, Next, Retry};
    match step {
        ProductStep::Title => match validate::title(input) {
            Ok(title) => Next(ProductStep::Category { title }, "Send the category:".to_string()),
            Err(msg) => Retry(msg),
        },
        ProductStep::Category { title } => match validate::non_empty(input, "Category") {
            Ok(category) => match family {
                CatalogFamily::Goods => Next(
                    ProductStep::Kind { title, category },
                    "Send the type: weapon or armor".to_string(),
                ),
                CatalogFamily::Escort => Next(
                    ProductStep::Price {
                        title,
                        category,
                        kind: ProductKind::Escort,
                    },
                    "Send the price (whole number):".to_string(),
                ),
            },
            Err(msg) => Retry(msg),
        },
        ProductStep::Kind { title, category } => match validate::goods_kind(input) {
            Ok(kind) => Next(
                ProductStep::Price {
                    title,
                    category,
                    kind,
                },
                "Send the price (whole number):".to_string(),
            ),
            Err(msg) => Retry(msg),
        },
        ProductStep::Price {
            title,
            category,
            kind,
        } => match validate::price(input) {
            Ok(price) => Next(
                ProductStep::Description {
                    title,
                    category,
                    kind,
                    price,
                },
                "Send the description, or - to leave it empty:".to_string(),
            ),
            Err(msg) => Retry(msg),
        },
        ProductStep::Description {
            title,
            category,
            kind,
            price,
        } => Done(NewProduct {
            title,
            kind,
            category,
            price,
            description: validate::optional_description(input),
        }),
    }
}

struct LiveSession {
    generation: u64,
    session: Session,
}

/// At most one live dialog per user. Every `begin` bumps a generation so a
/// slow step cannot overwrite a dialog started after it.
#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<HashMap<UserId, LiveSession>>,
    generation: Mutex<u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self, user_id: UserId, session: Session) -> u64 {
        let generation = {
            let mut counter = self.generation.lock().await;
            *counter += 1;
            *counter
        };
        self.live.lock().await.insert(
            user_id,
            LiveSession {
                generation,
                session,
            },
        );
        generation
    }

    pub async fn current(&self, user_id: UserId) -> Option<(u64, Session)> {
        self.live
            .lock()
            .await
            .get(&user_id)
            .map(|l| (l.generation, l.session.clone()))
    }

    /// Applies the outcome of a step only if the dialog was not replaced meanwhile.
    pub async fn settle(&self, user_id: UserId, generation: u64, next: Option<Session>) {
        let mut live = self.live.lock().await;
        if live.get(&user_id).map(|l| l.generation) != Some(generation) {
            return;
        }
        match next {
            Some(session) => {
                live.insert(
                    user_id,
                    LiveSession {
                        generation,
                        session,
                    },
                );
            }
            None => {
                live.remove(&user_id);
            }
        }
    }

    pub async fn cancel(&self, user_id: UserId) -> bool {
        self.live.lock().await.remove(&user_id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub text: String,
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Self {
            text: text.into(),
            keyboard: Some(keyboard),
        }
    }
}

pub(crate) enum Step {
    /// Input refused; the session stays exactly as it was.
    Stay(Reply),
    Continue(Session, Reply),
    Finish(Reply),
}

impl Dispatcher {
    pub(crate) async fn begin_session(&self, ctx: &EventContext, session: Session) {
        let prompt = session.opening_prompt();
        tracing::debug!(user_id = ctx.user_id, operation = session.operation(), "session started");
        self.sessions.begin(ctx.user_id, session).await;
        self.say(ctx.chat_id, &prompt, None).await;
    }

    /// Feeds one text input into the user's live dialog.
    pub(crate) async fn continue_session(
        &self,
        ctx: &EventContext,
        generation: u64,
        session: Session,
        input: &str,
    ) -> Result<(), EngineError> {
        if validate::is_cancel(input) {
            self.sessions.cancel(ctx.user_id).await;
            let keyboard = if ctx.is_admin {
                ui::admin_menu()
            } else {
                ui::main_menu(false)
            };
            self.say(ctx.chat_id, "Cancelled.", Some(&keyboard)).await;
            return Ok(());
        }
        if session.requires_admin() && !ctx.is_admin {
            self.sessions.cancel(ctx.user_id).await;
            return Err(EngineError::Unauthorized);
        }

        let operation = session.operation();
        match self.step_session(ctx, session, input).await? {
            Step::Stay(reply) => {
                self.say(ctx.chat_id, &reply.text, reply.keyboard.as_ref()).await;
            }
            Step::Continue(next, reply) => {
                self.sessions.settle(ctx.user_id, generation, Some(next)).await;
                self.say(ctx.chat_id, &reply.text, reply.keyboard.as_ref()).await;
            }
            Step::Finish(reply) => {
                self.sessions.settle(ctx.user_id, generation, None).await;
                tracing::debug!(user_id = ctx.user_id, operation, "session finished");
                let is_admin = self.is_admin(ctx.user_id).await;
                let keyboard = reply.keyboard.unwrap_or_else(|| {
                    if is_admin {
                        ui::admin_menu()
                    } else {
                        ui::main_menu(false)
                    }
                });
                self.say(ctx.chat_id, &reply.text, Some(&keyboard)).await;
            }
        }
        Ok(())
    }

    async fn step_session(
        &self,
        ctx: &EventContext,
        session: Session,
        input: &str,
    ) -> Result<Step, EngineError> {
        let actor = ctx.user_id;
        let step = match session {
            Session::AdminLogin => {
                let expected = self.store.settings.read(|s| s.admin_password.clone()).await;
                if input.trim() != expected {
                    self.journal.record("admin_login_failed", Some(actor), json!({})).await;
                    return Ok(Step::Stay(Reply::text(
                        "Wrong password. Try again or send cancel:",
                    )));
                }
                let username = ctx.username.clone();
                self.store
                    .users
                    .update(|users| {
                        let user = users.entry(actor).or_insert_with(|| User {
                            username,
                            ..User::default()
                        });
                        user.is_admin = true;
                    })
                    .await?;
                self.journal.record("admin_login", Some(actor), json!({})).await;
                Step::Finish(Reply::with("✅ You are now an admin.", ui::admin_menu()))
            }

            Session::Broadcast => match validate::non_empty(input, "Text") {
                Ok(text) => self.finish_action(actor, Action::Broadcast { text }).await,
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::AddToCart { kind } => {
                let id = match validate::identifier(input) {
                    Ok(id) => id,
                    Err(msg) => return Ok(Step::Stay(Reply::text(msg))),
                };
                let product = self
                    .store
                    .products
                    .read(|p| p.iter().find(|p| p.id == id).cloned())
                    .await;
                match product {
                    None => Step::Stay(Reply::text(format!("No item with ID {id}. Try again:"))),
                    Some(p) if kind.is_some_and(|k| k != p.kind) => Step::Stay(Reply::text(
                        format!(
                            "Item {id} is not in {}. Try again:",
                            ui::kind_label(kind.unwrap_or(p.kind))
                        ),
                    )),
                    Some(p) => {
                        self.add_to_cart(ctx, p.id).await?;
                        Step::Finish(Reply::text(format!(
                            "🧺 Added \"{}\" to your cart.",
                            escape_html(&p.title)
                        )))
                    }
                }
            }

            Session::DisputeMessage { order_id } => {
                match self.orders.dispute(order_id, actor, input.trim()).await {
                    Ok(0) => Step::Finish(Reply::text(
                        "Support is unavailable right now. Please try again later.",
                    )),
                    Ok(_) => Step::Finish(Reply::text("📨 Your message was sent to support.")),
                    Err(EngineError::OrderNotFound(_)) => {
                        Step::Finish(Reply::text("Order not found."))
                    }
                    Err(EngineError::Unauthorized) => {
                        Step::Finish(Reply::text("You can only dispute your own orders."))
                    }
                    Err(EngineError::Validation(msg)) => Step::Finish(Reply::text(msg)),
                    Err(err) => return Err(err),
                }
            }

            Session::DisputeReply { order_id, user_id } => {
                let text = format!(
                    "💬 Support reply about order #{order_id}:\n\n{}",
                    escape_html(input.trim())
                );
                match self.transport.send_text(user_id, &text, None).await {
                    Ok(()) => {
                        self.journal
                            .record(
                                "dispute_reply",
                                Some(actor),
                                json!({ "order_id": order_id, "to": user_id }),
                            )
                            .await;
                        Step::Finish(Reply::text("Reply sent."))
                    }
                    Err(err) => {
                        tracing::warn!(order_id, user_id, error = %err, "dispute reply not delivered");
                        Step::Finish(Reply::text("Could not deliver the reply."))
                    }
                }
            }

            Session::ChangePassword => match validate::non_empty(input, "Password") {
                Ok(password) => {
                    self.store
                        .settings
                        .update(|s| s.admin_password = password)
                        .await?;
                    self.journal.record("password_changed", Some(actor), json!({})).await;
                    Step::Finish(Reply::text("🔑 Password changed."))
                }
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::ChangePaymentPhone => match validate::non_empty(input, "Phone") {
                Ok(phone) => self.finish_action(actor, Action::SetPaymentPhone { phone }).await,
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::ChangeSupportUsername => match validate::support_username(input) {
                Ok(username) => {
                    self.finish_action(actor, Action::SetSupportUsername { username })
                        .await
                }
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::GrantAdmin => match validate::user_id(input) {
                Ok(user_id) => self.finish_action(actor, Action::GrantAdmin { user_id }).await,
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::RevokeAdmin => match validate::user_id(input) {
                Ok(user_id) => match self.engine.run(actor, Action::RevokeAdmin { user_id }).await {
                    Ok(report) => Step::Finish(Reply::text(report.message)),
                    Err(err) => Step::Stay(Reply::text(format!("{err}. Try again:"))),
                },
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::AddProduct(step) => {
                self.product_step(actor, step, CatalogFamily::Goods, input)
                    .await
            }
            Session::AddEscort(step) => {
                self.product_step(actor, step, CatalogFamily::Escort, input)
                    .await
            }

            Session::DeleteItem { family } => {
                let id = match validate::identifier(input) {
                    Ok(id) => id,
                    Err(msg) => return Ok(Step::Stay(Reply::text(msg))),
                };
                match self.engine.run(actor, Action::Delete { family, id }).await {
                    Ok(report) => Step::Finish(Reply::text(format!("🗑 {}", report.message))),
                    Err(err @ (ActionError::NotFound(_) | ActionError::WrongFamily(_))) => {
                        Step::Stay(Reply::text(format!("{err}. Try again:")))
                    }
                    Err(err) => Step::Finish(Reply::text(err.to_string())),
                }
            }

            Session::ChangePrice {
                family,
                step: PriceStep::Identify,
            } => {
                let id = match validate::identifier(input) {
                    Ok(id) => id,
                    Err(msg) => return Ok(Step::Stay(Reply::text(msg))),
                };
                let product = self
                    .store
                    .products
                    .read(|p| p.iter().find(|p| p.id == id).cloned())
                    .await;
                match product {
                    Some(p) if family.contains(p.kind) => Step::Continue(
                        Session::ChangePrice {
                            family,
                            step: PriceStep::Price { id },
                        },
                        Reply::text(format!(
                            "\"{}\" costs {}. Send the new price:",
                            escape_html(&p.title),
                            p.price
                        )),
                    ),
                    Some(_) => Step::Stay(Reply::text(format!(
                        "ID {id} is not {}. Try again:",
                        family.label()
                    ))),
                    None => Step::Stay(Reply::text(format!("No item with ID {id}. Try again:"))),
                }
            }
            Session::ChangePrice {
                family,
                step: PriceStep::Price { id },
            } => match validate::price(input) {
                Ok(price) => {
                    self.finish_action(actor, Action::ChangePrice { family, id, price })
                        .await
                }
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::ChangeDescription(DescriptionStep::Identify) => {
                let id = match validate::identifier(input) {
                    Ok(id) => id,
                    Err(msg) => return Ok(Step::Stay(Reply::text(msg))),
                };
                let exists = self.store.products.read(|p| p.iter().any(|p| p.id == id)).await;
                if exists {
                    Step::Continue(
                        Session::ChangeDescription(DescriptionStep::Text { id }),
                        Reply::text("Send the new description, or - to clear it:"),
                    )
                } else {
                    Step::Stay(Reply::text(format!("No item with ID {id}. Try again:")))
                }
            }
            Session::ChangeDescription(DescriptionStep::Text { id }) => {
                let description = validate::optional_description(input);
                let action = if description.is_empty() {
                    Action::ClearDescription { id }
                } else {
                    Action::SetDescription { id, description }
                };
                self.finish_action(actor, action).await
            }

            Session::RejectReason { order_id } => match validate::non_empty(input, "Reason") {
                Ok(reason) => match self.orders.reject(order_id, &reason, actor).await {
                    Ok(_) => Step::Finish(Reply::text(format!("❌ Order #{order_id} rejected."))),
                    Err(EngineError::OrderNotFound(_)) => {
                        Step::Finish(Reply::text("Order not found."))
                    }
                    Err(err) => return Err(err),
                },
                Err(msg) => Step::Stay(Reply::text(msg)),
            },

            Session::OrderMessage { order_id } => match self.orders.find(order_id).await {
                None => Step::Finish(Reply::text("Order not found.")),
                Some(order) => {
                    let text = format!(
                        "✉️ Message about your order #{order_id}:\n\n{}",
                        escape_html(input.trim())
                    );
                    match self.transport.send_text(order.user_id, &text, None).await {
                        Ok(()) => {
                            self.journal
                                .record(
                                    "order_message",
                                    Some(actor),
                                    json!({ "order_id": order_id }),
                                )
                                .await;
                            Step::Finish(Reply::text("Message sent."))
                        }
                        Err(err) => {
                            tracing::warn!(order_id, error = %err, "order message not delivered");
                            Step::Finish(Reply::text("Could not deliver the message."))
                        }
                    }
                }
            },

            Session::Operator => match self.plans.propose(actor, input.trim(), Utc::now()).await {
                Ok(Proposal::Pending(plan)) => Step::Stay(Reply::with(
                    ui::plan_message(&plan.summary, plan.risk, &plan.actions),
                    ui::plan_controls(&plan.key),
                )),
                Ok(Proposal::Clarification(summary)) => Step::Stay(Reply::text(format!(
                    "🤔 Clarification needed:\n{}",
                    escape_html(&summary)
                ))),
                Err(EngineError::MalformedPlan) => Step::Stay(Reply::text(
                    "No plan produced. Try rephrasing the request.",
                )),
                Err(err) => return Err(err),
            },
        };
        Ok(step)
    }

    async fn product_step(
        &self,
        actor: UserId,
        step: ProductStep,
        family: CatalogFamily,
        input: &str,
    ) -> Step {
        let wrap = |step| match family {
            CatalogFamily::Goods => Session::AddProduct(step),
            CatalogFamily::Escort => Session::AddEscort(step),
        };
        match advance_product(step, family, input) {
            ProductTransition::Retry(msg) => Step::Stay(Reply::text(msg)),
            ProductTransition::Next(next, prompt) => Step::Continue(wrap(next), Reply::text(prompt)),
            ProductTransition::Done(draft) => {
                let action = match family {
                    CatalogFamily::Goods => Action::AddProduct(draft),
                    CatalogFamily::Escort => Action::AddEscort(draft),
                };
                self.finish_action(actor, action).await
            }
        }
    }

    async fn finish_action(&self, actor: UserId, action: Action) -> Step {
        match self.engine.run(actor, action).await {
            Ok(report) => Step::Finish(Reply::text(format!("✅ {}", report.message))),
            Err(err) => Step::Finish(Reply::text(format!("❌ {err}"))),
        }
    }
}
