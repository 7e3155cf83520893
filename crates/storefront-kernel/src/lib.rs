pub mod action;
pub mod text;
pub mod validate;

pub use action::{Action, ActionError, NewProduct, ACTION_TYPES};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use storefront_contracts::{ActionEnvelope, PlanProposal, Product, RiskLevel, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { retry_in: Duration },
}

/// A user may be served again once `cooldown` has passed since the last accepted event.
pub fn evaluate_cooldown(
    last_accepted: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> GateDecision {
    if let Some(last) = last_accepted {
        let elapsed = now - last;
        if elapsed < cooldown {
            return GateDecision::Deny {
                retry_in: cooldown - elapsed,
            };
        }
    }
    GateDecision::Allow
}

/// Smallest positive integer not already taken.
pub fn next_free_id<I>(taken: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    let taken: BTreeSet<u64> = taken.into_iter().collect();
    let mut candidate = 1;
    while taken.contains(&candidate) {
        candidate += 1;
    }
    candidate
}

pub fn order_total(items: &[Product]) -> u64 {
    items.iter().map(|p| p.price).sum()
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Content-derived key for a pending plan. Proposer and creation time are
/// mixed in so that identical drafts from two admins never share a key.
pub fn plan_key(
    admin_id: UserId,
    created_at: DateTime<Utc>,
    actions: &[ActionEnvelope],
) -> Result<String, String> {
    let digest = jcs_sha256_hex(&json!({ "actions": actions }))?;
    Ok(hash_id(
        "plan",
        &[
            &admin_id.to_string(),
            &created_at.timestamp_nanos_opt().unwrap_or_default().to_string(),
            &digest,
        ],
    ))
}

/// Parses a completion response into a plan. Anything that is not a JSON
/// object carrying an `actions` list yields `None`.
pub fn parse_plan_proposal(raw: &str) -> Option<PlanProposal> {
    let body = text::strip_code_fence(raw);
    let value: Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    let actions = object.get("actions")?.as_array()?;

    let summary = match object.get("summary") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let risk = RiskLevel::parse_lenient(object.get("risk").and_then(Value::as_str));
    let actions = actions.iter().map(envelope_from_value).collect();

    Some(PlanProposal {
        summary,
        risk,
        actions,
    })
}

fn envelope_from_value(value: &Value) -> ActionEnvelope {
    let action_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let params = value
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    ActionEnvelope {
        action_type,
        params,
    }
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
