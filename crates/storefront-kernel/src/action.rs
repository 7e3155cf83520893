//! The closed vocabulary of administrative mutations.
//!
//! Envelopes arrive untyped (from a completion service or an admin dialog) and
//! are turned into an [`Action`] only when they are about to run.

use crate::text::normalize_description;
use serde_json::Value;
use storefront_contracts::{ActionEnvelope, CatalogFamily, OrderId, ProductId, ProductKind, UserId};
use thiserror::Error;

pub const ACTION_TYPES: &[&str] = &[
    "add_product",
    "add_escort",
    "set_description",
    "clear_description",
    "delete_product",
    "delete_escort",
    "change_price",
    "change_escort_price",
    "order_reject",
    "send_message_to_user",
    "broadcast",
    "set_payment_phone",
    "set_support_username",
    "add_admin",
    "remove_admin",
    "get_stats",
    "restart_bot",
];

pub const DEFAULT_REJECT_REASON: &str = "Payment rejected";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("{0}")]
    InvalidParams(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    WrongFamily(String),
    #[error("{0}")]
    Delivery(String),
    #[error("store write failed: {0}")]
    Persist(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub title: String,
    pub kind: ProductKind,
    pub category: String,
    pub price: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AddProduct(NewProduct),
    AddEscort(NewProduct),
    SetDescription { id: ProductId, description: String },
    ClearDescription { id: ProductId },
    Delete { family: CatalogFamily, id: ProductId },
    ChangePrice { family: CatalogFamily, id: ProductId, price: u64 },
    RejectOrder { order_id: OrderId, reason: String },
    SendMessage { user_id: UserId, text: String },
    Broadcast { text: String },
    SetPaymentPhone { phone: String },
    SetSupportUsername { username: String },
    GrantAdmin { user_id: UserId },
    RevokeAdmin { user_id: UserId },
    GetStats,
    RestartBot,
}

impl Action {
    pub fn parse(envelope: &ActionEnvelope) -> Result<Action, ActionError> {
        let p = Params(&envelope.params);
        let action = match envelope.action_type.as_str() {
            "add_product" => {
                let kind = ProductKind::parse(&p.text("type"))
                    .filter(|k| k.family() == CatalogFamily::Goods)
                    .ok_or_else(|| {
                        ActionError::InvalidParams("type must be weapon or armor".to_string())
                    })?;
                Action::AddProduct(p.new_product("add_product", kind)?)
            }
            "add_escort" => Action::AddEscort(p.new_product("add_escort", ProductKind::Escort)?),
            "set_description" => Action::SetDescription {
                id: p.id("id")?,
                description: normalize_description(&p.text("description")),
            },
            "clear_description" => Action::ClearDescription { id: p.id("id")? },
            "delete_product" => Action::Delete {
                family: CatalogFamily::Goods,
                id: p.id("id")?,
            },
            "delete_escort" => Action::Delete {
                family: CatalogFamily::Escort,
                id: p.id("id")?,
            },
            "change_price" => Action::ChangePrice {
                family: CatalogFamily::Goods,
                id: p.id("id")?,
                price: p.price("price")?,
            },
            "change_escort_price" => Action::ChangePrice {
                family: CatalogFamily::Escort,
                id: p.id("id")?,
                price: p.price("price")?,
            },
            "order_reject" => {
                let reason = p.text("reason");
                Action::RejectOrder {
                    order_id: p.id("order_id")?,
                    reason: if reason.is_empty() {
                        DEFAULT_REJECT_REASON.to_string()
                    } else {
                        reason
                    },
                }
            }
            "send_message_to_user" => Action::SendMessage {
                user_id: p.user_id("user_id")?,
                text: p.required_text("text")?,
            },
            "broadcast" => Action::Broadcast {
                text: p.required_text("text")?,
            },
            "set_payment_phone" => Action::SetPaymentPhone {
                phone: p.required_text("phone")?,
            },
            "set_support_username" | "set_manager_username" => {
                let username = p.text("username").trim_start_matches('@').trim().to_string();
                if username.is_empty() {
                    return Err(ActionError::InvalidParams("username is required".to_string()));
                }
                Action::SetSupportUsername { username }
            }
            "add_admin" => Action::GrantAdmin {
                user_id: p.user_id("user_id")?,
            },
            "remove_admin" => Action::RevokeAdmin {
                user_id: p.user_id("user_id")?,
            },
            "get_stats" => Action::GetStats,
            "restart_bot" => Action::RestartBot,
            other => return Err(ActionError::UnknownAction(other.to_string())),
        };
        Ok(action)
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            Action::AddProduct(_) => "add_product",
            Action::AddEscort(_) => "add_escort",
            Action::SetDescription { .. } => "set_description",
            Action::ClearDescription { .. } => "clear_description",
            Action::Delete {
                family: CatalogFamily::Goods,
                ..
            } => "delete_product",
            Action::Delete {
                family: CatalogFamily::Escort,
                ..
            } => "delete_escort",
            Action::ChangePrice {
                family: CatalogFamily::Goods,
                ..
            } => "change_price",
            Action::ChangePrice {
                family: CatalogFamily::Escort,
                ..
            } => "change_escort_price",
            Action::RejectOrder { .. } => "order_reject",
            Action::SendMessage { .. } => "send_message_to_user",
            Action::Broadcast { .. } => "broadcast",
            Action::SetPaymentPhone { .. } => "set_payment_phone",
            Action::SetSupportUsername { .. } => "set_support_username",
            Action::GrantAdmin { .. } => "add_admin",
            Action::RevokeAdmin { .. } => "remove_admin",
            Action::GetStats => "get_stats",
            Action::RestartBot => "restart_bot",
        }
    }
}

struct Params<'a>(&'a Value);

impl Params<'_> {
    fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn text(&self, key: &str) -> String {
        match self.raw(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    }

    fn required_text(&self, key: &str) -> Result<String, ActionError> {
        let text = self.text(key);
        if text.is_empty() {
            return Err(ActionError::InvalidParams(format!("{key} is required")));
        }
        Ok(text)
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.raw(key)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn id(&self, key: &str) -> Result<u64, ActionError> {
        let value = self
            .int(key)
            .ok_or_else(|| ActionError::InvalidParams(format!("{key} must be an integer")))?;
        u64::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| ActionError::InvalidParams(format!("{key} must be a positive integer")))
    }

    fn user_id(&self, key: &str) -> Result<UserId, ActionError> {
        self.int(key)
            .ok_or_else(|| ActionError::InvalidParams(format!("{key} must be an integer")))
    }

    fn price(&self, key: &str) -> Result<u64, ActionError> {
        let value = self
            .int(key)
            .ok_or_else(|| ActionError::InvalidParams(format!("{key} must be an integer")))?;
        u64::try_from(value)
            .map_err(|_| ActionError::InvalidParams(format!("{key} must be non-negative")))
    }

    fn new_product(&self, action: &str, kind: ProductKind) -> Result<NewProduct, ActionError> {
        let title = self.text("title");
        if title.chars().count() < 2 {
            return Err(ActionError::InvalidParams(format!(
                "{action}: title must be at least 2 characters"
            )));
        }
        Ok(NewProduct {
            title,
            kind,
            category: self.text("category"),
            price: self.price("price")?,
            description: normalize_description(&self.text("description")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(action_type: &str, params: Value) -> ActionEnvelope {
        ActionEnvelope {
            action_type: action_type.to_string(),
            params,
        }
    }

    #[test]
    fn negative_price_is_refused() {
        let err = Action::parse(&envelope("change_price", json!({"id": 3, "price": -5})))
            .expect_err("negative price");
        assert_eq!(
            err,
            ActionError::InvalidParams("price must be non-negative".to_string())
        );
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let action = Action::parse(&envelope(
            "change_escort_price",
            json!({"id": "4", "price": "250"}),
        ))
        .unwrap();
        assert_eq!(
            action,
            Action::ChangePrice {
                family: CatalogFamily::Escort,
                id: 4,
                price: 250
            }
        );
        assert_eq!(action.action_type(), "change_escort_price");
    }

    #[test]
    fn unknown_and_missing_tags_are_rejected() {
        assert_eq!(
            Action::parse(&envelope("drop_tables", json!({}))).unwrap_err(),
            ActionError::UnknownAction("drop_tables".to_string())
        );
        assert!(matches!(
            Action::parse(&envelope("", json!({}))),
            Err(ActionError::UnknownAction(_))
        ));
    }

    #[test]
    fn add_product_requires_goods_type() {
        let err = Action::parse(&envelope(
            "add_product",
            json!({"title": "Sword", "type": "escort", "price": 10}),
        ))
        .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));

        let ok = Action::parse(&envelope(
            "add_product",
            json!({"title": "Sword", "type": "Weapon", "category": "melee", "price": 10,
                   "description": "As an AI I say   sharp"}),
        ))
        .unwrap();
        match ok {
            Action::AddProduct(p) => {
                assert_eq!(p.kind, ProductKind::Weapon);
                assert_eq!(p.description, "I say sharp");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reject_reason_defaults() {
        let action = Action::parse(&envelope("order_reject", json!({"order_id": 9}))).unwrap();
        assert_eq!(
            action,
            Action::RejectOrder {
                order_id: 9,
                reason: DEFAULT_REJECT_REASON.to_string()
            }
        );
    }

    #[test]
    fn support_username_drops_at_sign() {
        let action =
            Action::parse(&envelope("set_support_username", json!({"username": "@helpdesk"})))
                .unwrap();
        assert_eq!(
            action,
            Action::SetSupportUsername {
                username: "helpdesk".to_string()
            }
        );
    }

    #[test]
    fn every_listed_type_is_recognised() {
        for action_type in ACTION_TYPES {
            let parsed = Action::parse(&envelope(action_type, json!({})));
            assert!(
                !matches!(parsed, Err(ActionError::UnknownAction(_))),
                "{action_type} should be part of the vocabulary"
            );
        }
    }
}
