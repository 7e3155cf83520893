use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use storefront_contracts::{Order, OrderId, OrderStatus, Product, UserId};
use storefront_kernel::text::{escape_html, extract_fenced_block, synthetic_verdict};
use storefront_kernel::{next_free_id, order_total};

use crate::completion::{CompletionService, VisionCompletion};
use crate::error::EngineError;
use crate::journal::Journal;
use crate::store::Store;
use crate::transport::ChatTransport;
use crate::ui;

/// Order lifecycle: pending_payment → awaiting_check → rejected | accepted.
pub struct OrderDesk {
    store: Arc<Store>,
    transport: Arc<dyn ChatTransport>,
    completion: Arc<dyn CompletionService>,
    journal: Arc<Journal>,
    currency: String,
}

impl OrderDesk {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn ChatTransport>,
        completion: Arc<dyn CompletionService>,
        journal: Arc<Journal>,
        currency: String,
    ) -> Self {
        Self {
            store,
            transport,
            completion,
            journal,
            currency,
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub async fn admin_ids(&self) -> Vec<UserId> {
        self.store
            .users
            .read(|users| {
                users
                    .iter()
                    .filter(|(_, u)| u.is_admin)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .await
    }

    pub async fn find(&self, order_id: OrderId) -> Option<Order> {
        self.store
            .orders
            .read(|orders| orders.iter().find(|o| o.id == order_id).cloned())
            .await
    }

    /// Checks out the user's cart. An empty cart leaves every collection untouched.
    pub async fn create(&self, user_id: UserId) -> Result<Order, EngineError> {
        let mut users = self.store.users.lock().await;
        let products = self.store.products.lock().await;
        let mut orders = self.store.orders.lock().await;

        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| EngineError::NotFound(format!("user {user_id}")))?;
        let items: Vec<Product> = user
            .cart
            .iter()
            .filter_map(|id| products.iter().find(|p| p.id == *id).cloned())
            .collect();
        if items.is_empty() {
            return Err(EngineError::EmptyCart);
        }

        let order = Order {
            id: next_free_id(orders.iter().map(|o| o.id)),
            user_id,
            username: user.username.clone(),
            total: order_total(&items),
            items,
            status: OrderStatus::PendingPayment,
            created_at: Utc::now(),
            payment_evidence: None,
            evidence_received_at: None,
            reject_reason: None,
            rejected_at: None,
            accepted_at: None,
            last_verdict: None,
            last_verdict_at: None,
        };
        orders.push(order.clone());
        user.cart.clear();
        user.awaiting_payment_order_id = Some(order.id);

        self.store.orders.commit(&orders).await?;
        self.store.users.commit(&users).await?;
        drop(orders);
        drop(products);
        drop(users);

        tracing::info!(order_id = order.id, user_id, total = order.total, "order created");
        self.journal
            .record(
                "order_created",
                Some(user_id),
                json!({ "order_id": order.id, "total": order.total }),
            )
            .await;
        Ok(order)
    }

    /// Links a payment photo to the user's outstanding order and alerts every admin.
    pub async fn attach_evidence(
        &self,
        user_id: UserId,
        image_ref: &str,
    ) -> Result<Order, EngineError> {
        let order = {
            let mut users = self.store.users.lock().await;
            let mut orders = self.store.orders.lock().await;
            let order_id = users
                .get(&user_id)
                .and_then(|u| u.awaiting_payment_order_id)
                .ok_or(EngineError::NoLinkedOrder)?;

            let found = orders.iter_mut().find(|o| o.id == order_id);
            let order = match found {
                Some(order) if order.status == OrderStatus::PendingPayment => {
                    order.payment_evidence = Some(image_ref.to_string());
                    order.status = OrderStatus::AwaitingCheck;
                    order.evidence_received_at = Some(Utc::now());
                    order.clone()
                }
                // Settled elsewhere (rejected before any photo); the link is stale.
                Some(order) => {
                    tracing::info!(
                        order_id,
                        user_id,
                        status = order.status.as_str(),
                        "payment photo for a settled order ignored"
                    );
                    if let Some(user) = users.get_mut(&user_id) {
                        user.awaiting_payment_order_id = None;
                    }
                    self.store.users.commit(&users).await?;
                    return Err(EngineError::NoLinkedOrder);
                }
                None => {
                    if let Some(user) = users.get_mut(&user_id) {
                        user.awaiting_payment_order_id = None;
                    }
                    self.store.users.commit(&users).await?;
                    return Err(EngineError::OrderNotFound(order_id));
                }
            };
            self.store.orders.commit(&orders).await?;
            if let Some(user) = users.get_mut(&user_id) {
                user.awaiting_payment_order_id = None;
            }
            self.store.users.commit(&users).await?;
            order
        };

        self.journal
            .record(
                "payment_evidence",
                Some(user_id),
                json!({ "order_id": order.id }),
            )
            .await;

        let caption = format!(
            "💰 Payment photo received\n\n{}",
            ui::order_summary(&order, &self.currency)
        );
        let controls = ui::order_controls(order.id);
        for admin in self.admin_ids().await {
            let Err(err) = self
                .transport
                .send_photo(admin, image_ref, &caption, Some(&controls))
                .await
            else {
                continue;
            };
            tracing::warn!(admin, order_id = order.id, error = %err, "photo notice failed, sending text");
            let text = format!("{caption}\n\n(payment photo could not be attached)");
            if let Err(err) = self.transport.send_text(admin, &text, Some(&controls)).await {
                tracing::warn!(admin, order_id = order.id, error = %err, "admin notification failed");
            }
        }
        Ok(order)
    }

    /// Asks the vision service for an advisory verdict. Never changes the status.
    pub async fn verify(&self, order_id: OrderId, deep: bool) -> Result<String, EngineError> {
        let order = self
            .find(order_id)
            .await
            .ok_or(EngineError::OrderNotFound(order_id))?;
        let evidence = order
            .payment_evidence
            .clone()
            .ok_or_else(|| EngineError::Validation("order has no payment photo".to_string()))?;
        let verdict = match self.transport.resolve_photo_url(&evidence).await {
            Ok(image_url) => {
                let request = VisionCompletion {
                    instruction: verification_instruction(&order, &self.currency, deep),
                    image_url,
                    deep,
                };
                match self.completion.complete_vision(request).await {
                    Ok(raw) if !raw.trim().is_empty() => {
                        extract_fenced_block(&raw, "bash").to_string()
                    }
                    Ok(_) => synthetic_verdict(),
                    Err(err) => {
                        tracing::warn!(order_id, error = %err, "vision verification failed");
                        self.journal.error("verify_payment", &err, None).await;
                        synthetic_verdict()
                    }
                }
            }
            Err(err) => {
                tracing::warn!(order_id, error = %err, "payment photo could not be resolved");
                self.journal.error("verify_payment", &err, None).await;
                synthetic_verdict()
            }
        };

        let stored = self
            .store
            .orders
            .update(|orders| {
                orders.iter_mut().find(|o| o.id == order_id).map(|o| {
                    o.last_verdict = Some(verdict.clone());
                    o.last_verdict_at = Some(Utc::now());
                })
            })
            .await?;
        if stored.is_none() {
            return Err(EngineError::OrderNotFound(order_id));
        }
        self.journal
            .record("payment_verified", None, json!({ "order_id": order_id, "deep": deep }))
            .await;
        Ok(verdict)
    }

    /// Re-rejecting is allowed; the latest reason wins.
    pub async fn reject(
        &self,
        order_id: OrderId,
        reason: &str,
        actor: UserId,
    ) -> Result<Order, EngineError> {
        let order = self
            .store
            .orders
            .update(|orders| {
                orders.iter_mut().find(|o| o.id == order_id).map(|o| {
                    o.status = OrderStatus::Rejected;
                    o.reject_reason = Some(reason.to_string());
                    o.rejected_at = Some(Utc::now());
                    o.clone()
                })
            })
            .await?
            .ok_or(EngineError::OrderNotFound(order_id))?;

        self.journal
            .record(
                "order_rejected",
                Some(actor),
                json!({ "order_id": order_id, "reason": reason }),
            )
            .await;
        let text = format!(
            "❌ Your order #{order_id} was rejected.\nReason: {}\n\nIf you believe this is a mistake, open a dispute.",
            escape_html(reason)
        );
        if let Err(err) = self
            .transport
            .send_text(order.user_id, &text, Some(&ui::dispute_controls(order_id)))
            .await
        {
            tracing::warn!(order_id, error = %err, "rejection notice not delivered");
        }
        Ok(order)
    }

    pub async fn accept(&self, order_id: OrderId, actor: UserId) -> Result<Order, EngineError> {
        let order = self
            .store
            .orders
            .update(|orders| -> Result<Order, EngineError> {
                let order = orders
                    .iter_mut()
                    .find(|o| o.id == order_id)
                    .ok_or(EngineError::OrderNotFound(order_id))?;
                if order.status != OrderStatus::AwaitingCheck {
                    return Err(EngineError::Validation(format!(
                        "order #{order_id} is {}, only awaiting_check can be accepted",
                        order.status.as_str()
                    )));
                }
                order.status = OrderStatus::Accepted;
                order.accepted_at = Some(Utc::now());
                Ok(order.clone())
            })
            .await??;

        self.journal
            .record("order_accepted", Some(actor), json!({ "order_id": order_id }))
            .await;
        let text = format!("✅ Payment for order #{order_id} confirmed. Thank you!");
        if let Err(err) = self.transport.send_text(order.user_id, &text, None).await {
            tracing::warn!(order_id, error = %err, "acceptance notice not delivered");
        }
        Ok(order)
    }

    /// Forwards a customer's complaint about a rejected order to every admin.
    /// Returns how many admins received it.
    pub async fn dispute(
        &self,
        order_id: OrderId,
        user_id: UserId,
        message: &str,
    ) -> Result<usize, EngineError> {
        let order = self
            .find(order_id)
            .await
            .ok_or(EngineError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(EngineError::Unauthorized);
        }
        if order.status != OrderStatus::Rejected {
            return Err(EngineError::Validation(format!(
                "order #{order_id} is not rejected"
            )));
        }

        let text = format!(
            "⚖️ Dispute for order #{order_id} from {}:\n\n{}",
            if order.username.is_empty() {
                format!("id {user_id}")
            } else {
                format!("@{}", escape_html(&order.username))
            },
            escape_html(message)
        );
        let controls = ui::dispute_reply_controls(order_id, user_id);
        let mut delivered = 0;
        for admin in self.admin_ids().await {
            match self.transport.send_text(admin, &text, Some(&controls)).await {
                Ok(()) => delivered += 1,
                Err(err) => tracing::warn!(admin, order_id, error = %err, "dispute not delivered"),
            }
        }
        self.journal
            .record(
                "dispute",
                Some(user_id),
                json!({ "order_id": order_id, "delivered": delivered }),
            )
            .await;
        Ok(delivered)
    }

    pub async fn clear_all(&self, actor: UserId) -> Result<usize, EngineError> {
        let removed = self
            .store
            .orders
            .update(|orders| {
                let n = orders.len();
                orders.clear();
                n
            })
            .await?;
        self.journal
            .record("orders_cleared", Some(actor), json!({ "removed": removed }))
            .await;
        Ok(removed)
    }
}

fn verification_instruction(order: &Order, currency: &str, deep: bool) -> String {
    let depth = if deep {
        "Inspect every detail of the receipt: fonts, alignment, editing artefacts, and whether the amount, recipient and timestamp are consistent with each other."
    } else {
        "Check the essentials: amount, currency, recipient and whether the operation succeeded."
    };
    format!(
        "You verify payment receipts for an online shop.\n\
         Order #{id}, expected amount: {total} {currency}.\n\
         {depth}\n\
         Answer ONLY with one ```bash fenced block in exactly this template:\n\
         ```bash\n\
         Status: confirmed | suspicious | rejected | insufficient data\n\
         Confidence: high | medium | low\n\
         Amount match: yes | no | unknown\n\
         Found amount: <number or ->\n\
         Currency: <code or ->\n\
         Recipient: <name/phone or ->\n\
         Operation status: <text or ->\n\
         Date/time: <text or ->\n\
         Analysis: <short reasoning>\n\
         Conclusion: <one sentence>\n\
         Recommendation: <what the admin should do>\n\
         ```",
        id = order.id,
        total = order.total,
    )
}
