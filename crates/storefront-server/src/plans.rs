use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use storefront_contracts::{ActionEnvelope, RiskLevel, UserId};
use storefront_kernel::text::truncate_chars;
use storefront_kernel::{parse_plan_proposal, plan_key, ACTION_TYPES};
use tokio::sync::Mutex;

use crate::completion::{CompletionService, TextCompletion};
use crate::error::EngineError;
use crate::journal::Journal;
use crate::store::Store;

const RECENT_ORDERS: usize = 100;
const RECENT_LOG: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPlan {
    pub key: String,
    pub admin_id: UserId,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub risk: RiskLevel,
    pub actions: Vec<ActionEnvelope>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// The model answered with an empty action list; show its summary and keep nothing.
    Clarification(String),
    Pending(PendingPlan),
}

/// Holds AI-drafted plans until their proposer confirms or denies them.
/// Plans older than `ttl` are reaped on every access.
pub struct PlanDesk {
    store: Arc<Store>,
    completion: Arc<dyn CompletionService>,
    journal: Arc<Journal>,
    pending: Mutex<HashMap<String, PendingPlan>>,
    ttl: Duration,
    max_pending: usize,
    context_max_chars: usize,
    shop_name: String,
    currency: String,
}

impl PlanDesk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        completion: Arc<dyn CompletionService>,
        journal: Arc<Journal>,
        ttl_ms: u64,
        max_pending: usize,
        context_max_chars: usize,
        shop_name: String,
        currency: String,
    ) -> Self {
        Self {
            store,
            completion,
            journal,
            pending: Mutex::new(HashMap::new()),
            ttl: Duration::milliseconds(ttl_ms as i64),
            max_pending: max_pending.max(1),
            context_max_chars,
            shop_name,
            currency,
        }
    }

    pub async fn propose(
        &self,
        admin_id: UserId,
        request: &str,
        now: DateTime<Utc>,
    ) -> Result<Proposal, EngineError> {
        let context = self.context_snapshot(now).await;
        let raw = match self
            .completion
            .complete_text(TextCompletion {
                system: operator_instruction(),
                context,
                user: request.to_string(),
            })
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                self.journal.error("plan_propose", &err, Some(admin_id)).await;
                String::new()
            }
        };

        let Some(proposal) = parse_plan_proposal(&raw) else {
            self.journal
                .record("plan_malformed", Some(admin_id), json!({ "chars": raw.len() }))
                .await;
            return Err(EngineError::MalformedPlan);
        };
        if proposal.actions.is_empty() {
            return Ok(Proposal::Clarification(proposal.summary));
        }

        let key = plan_key(admin_id, now, &proposal.actions).map_err(EngineError::Validation)?;
        let plan = PendingPlan {
            key: key.clone(),
            admin_id,
            created_at: now,
            summary: proposal.summary,
            risk: proposal.risk,
            actions: proposal.actions,
        };
        {
            let mut pending = self.pending.lock().await;
            self.reap(&mut pending, now);
            while pending.len() >= self.max_pending {
                let oldest = pending
                    .values()
                    .min_by_key(|p| p.created_at)
                    .map(|p| p.key.clone());
                match oldest {
                    Some(k) => {
                        pending.remove(&k);
                    }
                    None => break,
                }
            }
            pending.insert(key.clone(), plan.clone());
        }
        tracing::info!(plan_key = %key, admin_id, actions = plan.actions.len(), "plan proposed");
        self.journal
            .record(
                "plan_proposed",
                Some(admin_id),
                json!({ "plan_key": key, "risk": plan.risk.as_str(), "actions": plan.actions.len() }),
            )
            .await;
        Ok(Proposal::Pending(plan))
    }

    /// Removes and returns the plan for execution. A different actor gets
    /// `Unauthorized` and the plan stays pending.
    pub async fn take_for_confirm(
        &self,
        key: &str,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PendingPlan, EngineError> {
        let plan = self.claim(key, actor, now).await?;
        self.journal
            .record("plan_confirmed", Some(actor), json!({ "plan_key": key }))
            .await;
        Ok(plan)
    }

    pub async fn deny(&self, key: &str, actor: UserId, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.claim(key, actor, now).await?;
        self.journal
            .record("plan_denied", Some(actor), json!({ "plan_key": key }))
            .await;
        Ok(())
    }

    pub async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    pub async fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().await;
        self.reap(&mut pending, Utc::now());
        pending.len()
    }

    async fn claim(
        &self,
        key: &str,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<PendingPlan, EngineError> {
        let mut pending = self.pending.lock().await;
        self.reap(&mut pending, now);
        match pending.get(key).map(|p| p.admin_id) {
            None => Err(EngineError::NotFound(format!("plan {key}"))),
            Some(owner) if owner != actor => {
                tracing::warn!(plan_key = %key, actor, owner, "plan claimed by non-proposer");
                Err(EngineError::Unauthorized)
            }
            Some(_) => pending
                .remove(key)
                .ok_or_else(|| EngineError::NotFound(format!("plan {key}"))),
        }
    }

    fn reap(&self, pending: &mut HashMap<String, PendingPlan>, now: DateTime<Utc>) {
        let ttl = self.ttl;
        pending.retain(|_, plan| now - plan.created_at < ttl);
    }

    async fn context_snapshot(&self, now: DateTime<Utc>) -> String {
        let settings = self.store.settings.snapshot().await;
        let products = self.store.products.snapshot().await;
        let users_count = self.store.users.read(|u| u.len()).await;
        let orders = self
            .store
            .orders
            .read(|orders| {
                let skip = orders.len().saturating_sub(RECENT_ORDERS);
                orders[skip..].to_vec()
            })
            .await;
        let log_tail = self
            .store
            .log
            .read(|log| {
                let skip = log.len().saturating_sub(RECENT_LOG);
                log[skip..].to_vec()
            })
            .await;
        let snapshot = json!({
            "shop": { "name": self.shop_name, "currency": self.currency },
            "settings": {
                "payment_phone": settings.payment_phone,
                "support_username": settings.support_username,
            },
            "products": products,
            "users_count": users_count,
            "orders": orders,
            "logs_tail": log_tail,
            "server_time": now.to_rfc3339(),
        });
        let text = serde_json::to_string(&snapshot).unwrap_or_default();
        truncate_chars(&text, self.context_max_chars).to_string()
    }
}

fn operator_instruction() -> String {
    format!(
        "You are the operator assistant of a small online shop. Turn the admin's request into a plan.\n\
         Reply with ONE JSON object and nothing else:\n\
         {{\"summary\": \"what will happen\", \"risk\": \"low|medium|high\", \"actions\": [{{\"type\": \"...\", \"params\": {{...}}}}]}}\n\
         If the request is unclear, reply with an empty actions list and ask your question in summary.\n\
         Allowed action types: {types}.\n\
         Parameters:\n\
         - add_product {{title, type: weapon|armor, category, price, description}}\n\
         - add_escort {{title, category, price, description}}\n\
         - set_description {{id, description}}; clear_description {{id}}\n\
         - delete_product {{id}}; delete_escort {{id}}\n\
         - change_price {{id, price}}; change_escort_price {{id, price}}\n\
         - order_reject {{order_id, reason}}\n\
         - send_message_to_user {{user_id, text}}; broadcast {{text}}\n\
         - set_payment_phone {{phone}}; set_support_username {{username}}\n\
         - add_admin {{user_id}}; remove_admin {{user_id}}\n\
         - get_stats {{}}; restart_bot {{}}\n\
         Prices are whole numbers and never negative. Use ids from CONTEXT only. Mark anything \
         touching many users, admins or deletions as high risk.",
        types = ACTION_TYPES.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionError, VisionCompletion};
    use async_trait::async_trait;
    use storefront_config::Config;

    struct Canned(&'static str);

    #[async_trait]
    impl CompletionService for Canned {
        async fn complete_text(&self, _: TextCompletion) -> Result<String, CompletionError> {
            Ok(self.0.to_string())
        }
        async fn complete_vision(&self, _: VisionCompletion) -> Result<String, CompletionError> {
            Err(CompletionError::Status(500))
        }
    }

    async fn desk(reply: &'static str, ttl_ms: u64, max_pending: usize) -> PlanDesk {
        let store = Arc::new(Store::open(&Config::default()).await.unwrap());
        let journal = Arc::new(Journal::new(store.clone(), 100));
        PlanDesk::new(
            store,
            Arc::new(Canned(reply)),
            journal,
            ttl_ms,
            max_pending,
            35_000,
            "Shop".to_string(),
            "TMT".to_string(),
        )
    }

    const STATS_PLAN: &str =
        r#"{"summary":"show stats","risk":"low","actions":[{"type":"get_stats","params":{}}]}"#;

    #[tokio::test]
    async fn expired_plans_are_stale() {
        let desk = desk(STATS_PLAN, 1_000, 8).await;
        let now = Utc::now();
        let Proposal::Pending(plan) = desk.propose(1, "stats", now).await.unwrap() else {
            panic!("expected pending plan");
        };
        let later = now + Duration::seconds(2);
        assert!(matches!(
            desk.take_for_confirm(&plan.key, 1, later).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn oldest_plan_is_evicted_at_capacity() {
        let desk = desk(STATS_PLAN, 60_000, 2).await;
        let t0 = Utc::now();
        let mut keys = Vec::new();
        for i in 0..3 {
            match desk.propose(1, "stats", t0 + Duration::milliseconds(i)).await.unwrap() {
                Proposal::Pending(plan) => keys.push(plan.key),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(!desk.is_pending(&keys[0]).await);
        assert!(desk.is_pending(&keys[1]).await);
        assert!(desk.is_pending(&keys[2]).await);
    }

    #[tokio::test]
    async fn empty_action_list_is_a_clarification() {
        let desk = desk(r#"{"summary":"which item?","actions":[]}"#, 60_000, 8).await;
        assert_eq!(
            desk.propose(1, "raise it", Utc::now()).await.unwrap(),
            Proposal::Clarification("which item?".to_string())
        );
        assert_eq!(desk.pending_count().await, 0);
    }

    #[tokio::test]
    async fn prose_reply_is_malformed() {
        let desk = desk("Sure! I will raise the price.", 60_000, 8).await;
        assert!(matches!(
            desk.propose(1, "raise it", Utc::now()).await,
            Err(EngineError::MalformedPlan)
        ));
    }

    #[test]
    fn instruction_lists_every_action_type() {
        let text = operator_instruction();
        for action_type in ACTION_TYPES {
            assert!(text.contains(action_type));
        }
    }
}
