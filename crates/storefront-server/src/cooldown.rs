use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use storefront_contracts::UserId;
use storefront_kernel::{evaluate_cooldown, GateDecision};
use tokio::sync::Mutex;

const REAP_THRESHOLD: usize = 10_000;

/// Per-user rate limiter in front of every inbound event.
pub struct CooldownGuard {
    window: Duration,
    last_accepted: Mutex<HashMap<UserId, DateTime<Utc>>>,
}

impl CooldownGuard {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            window: Duration::milliseconds(cooldown_ms as i64),
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Records `now` only when the event is let through.
    pub async fn try_accept(&self, user_id: UserId, now: DateTime<Utc>) -> GateDecision {
        let mut last = self.last_accepted.lock().await;
        let decision = evaluate_cooldown(last.get(&user_id).copied(), now, self.window);
        if decision == GateDecision::Allow {
            if last.len() >= REAP_THRESHOLD {
                let window = self.window;
                last.retain(|_, at| now - *at < window);
            }
            last.insert(user_id, now);
        }
        decision
    }
}
