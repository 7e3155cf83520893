use std::sync::Arc;

use serde_json::json;
use storefront_contracts::{
    ActionEnvelope, ActionOutcome, CatalogFamily, OrderStatus, Product, ProductKind, User, UserId,
};
use storefront_kernel::{next_free_id, Action, ActionError, NewProduct};

use crate::error::EngineError;
use crate::journal::Journal;
use crate::orders::OrderDesk;
use crate::store::{Store, StoreError};
use crate::transport::ChatTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub message: String,
    /// The process should restart once the surrounding batch is done.
    pub restart: bool,
}

impl ActionReport {
    fn done(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            restart: false,
        }
    }
}

/// Applies allow-listed actions one at a time. A batch never stops on a
/// failed action and nothing is rolled back.
pub struct ActionEngine {
    store: Arc<Store>,
    transport: Arc<dyn ChatTransport>,
    journal: Arc<Journal>,
    orders: Arc<OrderDesk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<ActionOutcome>,
    pub restart: bool,
}

impl ActionEngine {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn ChatTransport>,
        journal: Arc<Journal>,
        orders: Arc<OrderDesk>,
    ) -> Self {
        Self {
            store,
            transport,
            journal,
            orders,
        }
    }

    pub async fn run_batch(&self, actor: UserId, envelopes: &[ActionEnvelope]) -> BatchReport {
        let mut report = BatchReport::default();
        for envelope in envelopes {
            let (outcome, restart) = self.run_envelope(actor, envelope).await;
            report.restart |= restart;
            report.outcomes.push(outcome);
        }
        report
    }

    pub async fn run_envelope(
        &self,
        actor: UserId,
        envelope: &ActionEnvelope,
    ) -> (ActionOutcome, bool) {
        let result = match Action::parse(envelope) {
            Ok(action) => self.execute(actor, action).await,
            Err(err) => Err(err),
        };
        let action_type = if envelope.action_type.is_empty() {
            "unknown"
        } else {
            envelope.action_type.as_str()
        };
        let outcome = outcome_of(action_type, &result);
        self.note(actor, &outcome).await;
        let restart = result.map(|r| r.restart).unwrap_or(false);
        (outcome, restart)
    }

    /// Runs an already typed action (admin dialogs) with the same journaling
    /// as a plan step.
    pub async fn run(&self, actor: UserId, action: Action) -> Result<ActionReport, ActionError> {
        let action_type = action.action_type();
        let result = self.execute(actor, action).await;
        self.note(actor, &outcome_of(action_type, &result)).await;
        result
    }

    async fn note(&self, actor: UserId, outcome: &ActionOutcome) {
        tracing::info!(
            actor,
            action_type = %outcome.action_type,
            ok = outcome.ok,
            "action executed"
        );
        self.journal
            .record(
                "action_executed",
                Some(actor),
                json!({ "type": outcome.action_type, "ok": outcome.ok, "msg": outcome.message }),
            )
            .await;
    }

    pub async fn execute(&self, actor: UserId, action: Action) -> Result<ActionReport, ActionError> {
        match action {
            Action::AddProduct(draft) | Action::AddEscort(draft) => self.add(draft).await,
            Action::SetDescription { id, description } => {
                self.describe(id, description).await
            }
            Action::ClearDescription { id } => self.describe(id, String::new()).await,
            Action::Delete { family, id } => {
                self.store
                    .products
                    .update(|products| -> Result<ActionReport, ActionError> {
                        let index = locate(products, family, id)?;
                        let removed = products.remove(index);
                        Ok(ActionReport::done(format!(
                            "deleted id={} \"{}\"",
                            removed.id, removed.title
                        )))
                    })
                    .await
                    .map_err(persist)?
            }
            Action::ChangePrice { family, id, price } => {
                self.store
                    .products
                    .update(|products| -> Result<ActionReport, ActionError> {
                        let index = locate(products, family, id)?;
                        let old = std::mem::replace(&mut products[index].price, price);
                        Ok(ActionReport::done(format!("price id={id}: {old} -> {price}")))
                    })
                    .await
                    .map_err(persist)?
            }
            Action::RejectOrder { order_id, reason } => {
                match self.orders.reject(order_id, &reason, actor).await {
                    Ok(_) => Ok(ActionReport::done(format!("order #{order_id} rejected"))),
                    Err(EngineError::OrderNotFound(_)) => {
                        Err(ActionError::NotFound(format!("order {order_id} not found")))
                    }
                    Err(err) => Err(ActionError::Persist(err.to_string())),
                }
            }
            Action::SendMessage { user_id, text } => {
                self.transport
                    .send_text(user_id, &text, None)
                    .await
                    .map_err(|e| ActionError::Delivery(e.to_string()))?;
                Ok(ActionReport::done(format!("sent to {user_id}")))
            }
            Action::Broadcast { text } => {
                let recipients: Vec<UserId> =
                    self.store.users.read(|users| users.keys().copied().collect()).await;
                let mut delivered = 0;
                for user_id in &recipients {
                    match self.transport.send_text(*user_id, &text, None).await {
                        Ok(()) => delivered += 1,
                        Err(err) => {
                            tracing::debug!(user_id, error = %err, "broadcast delivery failed")
                        }
                    }
                }
                Ok(ActionReport::done(format!(
                    "broadcast sent to {delivered} of {}",
                    recipients.len()
                )))
            }
            Action::SetPaymentPhone { phone } => {
                self.store
                    .settings
                    .update(|s| s.payment_phone = phone.clone())
                    .await
                    .map_err(persist)?;
                Ok(ActionReport::done(format!("payment phone set to {phone}")))
            }
            Action::SetSupportUsername { username } => {
                self.store
                    .settings
                    .update(|s| s.support_username = username.clone())
                    .await
                    .map_err(persist)?;
                Ok(ActionReport::done(format!("support handle set to @{username}")))
            }
            Action::GrantAdmin { user_id } => {
                self.store
                    .users
                    .update(|users| users.entry(user_id).or_insert_with(User::default).is_admin = true)
                    .await
                    .map_err(persist)?;
                Ok(ActionReport::done(format!("{user_id} is now an admin")))
            }
            Action::RevokeAdmin { user_id } => {
                self.store
                    .users
                    .update(|users| match users.get_mut(&user_id) {
                        Some(user) if user.is_admin => {
                            user.is_admin = false;
                            Ok(ActionReport::done(format!("{user_id} is no longer an admin")))
                        }
                        _ => Err(ActionError::NotFound(format!("{user_id} is not an admin"))),
                    })
                    .await
                    .map_err(persist)?
            }
            Action::GetStats => Ok(ActionReport::done(self.stats().await.to_string())),
            Action::RestartBot => Ok(ActionReport {
                message: "restart scheduled".to_string(),
                restart: true,
            }),
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        let users = self.store.users.read(|u| u.len()).await;
        let admins = self
            .store
            .users
            .read(|u| u.values().filter(|v| v.is_admin).count())
            .await;
        let (weapon, armor, escort) = self
            .store
            .products
            .read(|products| {
                let count =
                    |kind: ProductKind| products.iter().filter(|p| p.kind == kind).count();
                (
                    count(ProductKind::Weapon),
                    count(ProductKind::Armor),
                    count(ProductKind::Escort),
                )
            })
            .await;
        let (orders, by_status) = self
            .store
            .orders
            .read(|orders| {
                let count = |status: OrderStatus| {
                    orders.iter().filter(|o| o.status == status).count()
                };
                (
                    orders.len(),
                    json!({
                        "pending_payment": count(OrderStatus::PendingPayment),
                        "awaiting_check": count(OrderStatus::AwaitingCheck),
                        "rejected": count(OrderStatus::Rejected),
                        "accepted": count(OrderStatus::Accepted),
                    }),
                )
            })
            .await;
        json!({
            "users": users,
            "admins": admins,
            "orders": orders,
            "orders_by_status": by_status,
            "products": { "weapon": weapon, "armor": armor, "escort": escort },
        })
    }

    async fn add(&self, draft: NewProduct) -> Result<ActionReport, ActionError> {
        let id = self
            .store
            .products
            .update(|products| {
                let id = next_free_id(products.iter().map(|p| p.id));
                products.push(Product {
                    id,
                    title: draft.title.clone(),
                    kind: draft.kind,
                    category: draft.category.clone(),
                    price: draft.price,
                    description: draft.description.clone(),
                });
                id
            })
            .await
            .map_err(persist)?;
        Ok(ActionReport::done(format!(
            "added {} id={id} \"{}\"",
            draft.kind.as_str(),
            draft.title
        )))
    }

    async fn describe(&self, id: u64, description: String) -> Result<ActionReport, ActionError> {
        self.store
            .products
            .update(|products| match products.iter_mut().find(|p| p.id == id) {
                Some(product) => {
                    let cleared = description.is_empty();
                    product.description = description;
                    Ok(ActionReport::done(if cleared {
                        format!("description cleared for id={id}")
                    } else {
                        format!("description updated for id={id}")
                    }))
                }
                None => Err(ActionError::NotFound(format!("product {id} not found"))),
            })
            .await
            .map_err(persist)?
    }
}

fn locate(products: &[Product], family: CatalogFamily, id: u64) -> Result<usize, ActionError> {
    let index = products
        .iter()
        .position(|p| p.id == id)
        .ok_or_else(|| ActionError::NotFound(format!("product {id} not found")))?;
    if !family.contains(products[index].kind) {
        return Err(ActionError::WrongFamily(format!(
            "id {id} is not {}",
            family.label()
        )));
    }
    Ok(index)
}

fn outcome_of(action_type: &str, result: &Result<ActionReport, ActionError>) -> ActionOutcome {
    let (ok, message) = match result {
        Ok(report) => (true, report.message.clone()),
        Err(err) => (false, err.to_string()),
    };
    ActionOutcome {
        action_type: action_type.to_string(),
        ok,
        message,
    }
}

fn persist(err: StoreError) -> ActionError {
    ActionError::Persist(err.to_string())
}
