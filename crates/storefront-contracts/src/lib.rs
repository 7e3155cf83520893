use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "0.1.0";

pub type UserId = i64;
pub type ChatId = i64;
pub type ProductId = u64;
pub type OrderId = u64;

/// Users are keyed by their transport-assigned identifier.
pub type UserDirectory = BTreeMap<UserId, User>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Weapon,
    Armor,
    Escort,
}

impl ProductKind {
    pub const ALL: [ProductKind; 3] = [ProductKind::Weapon, ProductKind::Armor, ProductKind::Escort];

    pub fn as_str(self) -> &'static str {
        match self {
            ProductKind::Weapon => "weapon",
            ProductKind::Armor => "armor",
            ProductKind::Escort => "escort",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "weapon" => Some(ProductKind::Weapon),
            "armor" => Some(ProductKind::Armor),
            "escort" => Some(ProductKind::Escort),
            _ => None,
        }
    }

    pub fn family(self) -> CatalogFamily {
        match self {
            ProductKind::Weapon | ProductKind::Armor => CatalogFamily::Goods,
            ProductKind::Escort => CatalogFamily::Escort,
        }
    }
}

/// Deletion and repricing are scoped to one family: goods (weapon, armor) or escorts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CatalogFamily {
    Goods,
    Escort,
}

impl CatalogFamily {
    pub fn contains(self, kind: ProductKind) -> bool {
        kind.family() == self
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CatalogFamily::Goods => "goods",
            CatalogFamily::Escort => "escort",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "goods" => Some(CatalogFamily::Goods),
            "escort" => Some(CatalogFamily::Escort),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CatalogFamily::Goods => "weapon/armor",
            CatalogFamily::Escort => "escort",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub id: ProductId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: ProductKind,
    #[serde(default)]
    pub category: String,
    pub price: u64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cart: Vec<ProductId>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub awaiting_payment_order_id: Option<OrderId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    AwaitingCheck,
    Rejected,
    Accepted,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::AwaitingCheck => "awaiting_check",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    /// Products as they were at checkout; later catalog edits never touch this.
    pub items: Vec<Product>,
    pub total: u64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payment_evidence: Option<String>,
    #[serde(default)]
    pub evidence_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_verdict: Option<String>,
    #[serde(default)]
    pub last_verdict_at: Option<DateTime<Utc>>,
}

/// The persisted `settings` document, editable at runtime by administrators.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShopSettings {
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub payment_phone: String,
    #[serde(default)]
    pub support_username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Unrecognised or missing tiers are treated as medium.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("low") => RiskLevel::Low,
            Some("high") => RiskLevel::High,
            _ => RiskLevel::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// One proposed mutation exactly as it was drafted. Parameters stay untyped
/// until execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEnvelope {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanProposal {
    pub summary: String,
    pub risk: RiskLevel,
    pub actions: Vec<ActionEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionOutcome {
    #[serde(rename = "type")]
    pub action_type: String,
    pub ok: bool,
    #[serde(rename = "msg")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub user_id: UserId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(flatten)]
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundPayload {
    Text {
        text: String,
    },
    Photo {
        file_id: String,
    },
    Button {
        data: String,
        #[serde(default)]
        callback_id: Option<String>,
        #[serde(default)]
        message_id: Option<i64>,
    },
}

impl InboundPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundPayload::Text { .. } => "text",
            InboundPayload::Photo { .. } => "photo",
            InboundPayload::Button { .. } => "button",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Button {
    pub fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback: Some(data.into()),
            url: None,
        }
    }

    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback: None,
            url: Some(url.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        if !buttons.is_empty() {
            self.rows.push(buttons);
        }
        self
    }

    pub fn button(self, button: Button) -> Self {
        self.row(vec![button])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn callbacks(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .flatten()
            .filter_map(|b| b.callback.as_deref())
    }
}

/// A call the engine made into the chat transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        chat_id: ChatId,
        text: String,
        #[serde(default)]
        keyboard: Option<Keyboard>,
    },
    Photo {
        chat_id: ChatId,
        photo: String,
        caption: String,
        #[serde(default)]
        keyboard: Option<Keyboard>,
    },
    EditControls {
        chat_id: ChatId,
        message_id: i64,
        #[serde(default)]
        keyboard: Option<Keyboard>,
    },
    ButtonAnswer {
        callback_id: String,
        #[serde(default)]
        text: Option<String>,
        alert: bool,
    },
}

impl OutboundMessage {
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            OutboundMessage::Text { chat_id, .. }
            | OutboundMessage::Photo { chat_id, .. }
            | OutboundMessage::EditControls { chat_id, .. } => Some(*chat_id),
            OutboundMessage::ButtonAnswer { .. } => None,
        }
    }

    /// Visible text: message body, photo caption or button answer.
    pub fn text(&self) -> Option<&str> {
        match self {
            OutboundMessage::Text { text, .. } => Some(text),
            OutboundMessage::Photo { caption, .. } => Some(caption),
            OutboundMessage::ButtonAnswer { text, .. } => text.as_deref(),
            OutboundMessage::EditControls { .. } => None,
        }
    }

    pub fn keyboard(&self) -> Option<&Keyboard> {
        match self {
            OutboundMessage::Text { keyboard, .. }
            | OutboundMessage::Photo { keyboard, .. }
            | OutboundMessage::EditControls { keyboard, .. } => keyboard.as_ref(),
            OutboundMessage::ButtonAnswer { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_button_event_parses_flattened_kind() {
        let raw = json!({
            "user_id": 42,
            "chat_id": 42,
            "kind": "button",
            "data": "cart:open",
            "callback_id": "cb-1"
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.user_id, 42);
        assert_eq!(
            event.payload,
            InboundPayload::Button {
                data: "cart:open".to_string(),
                callback_id: Some("cb-1".to_string()),
                message_id: None,
            }
        );
    }

    #[test]
    fn user_directory_round_trips_integer_keys() {
        let mut users = UserDirectory::new();
        users.insert(
            -100,
            User {
                username: "neg".to_string(),
                ..User::default()
            },
        );
        let text = serde_json::to_string(&users).unwrap();
        let back: UserDirectory = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get(&-100).unwrap().username, "neg");
    }

    #[test]
    fn product_kind_parse_is_case_insensitive_and_scoped() {
        assert_eq!(ProductKind::parse(" Armor "), Some(ProductKind::Armor));
        assert_eq!(ProductKind::parse("tank"), None);
        assert!(CatalogFamily::Goods.contains(ProductKind::Weapon));
        assert!(!CatalogFamily::Goods.contains(ProductKind::Escort));
    }

    #[test]
    fn risk_defaults_to_medium() {
        assert_eq!(RiskLevel::parse_lenient(None), RiskLevel::Medium);
        assert_eq!(RiskLevel::parse_lenient(Some("HIGH")), RiskLevel::High);
        assert_eq!(RiskLevel::parse_lenient(Some("extreme")), RiskLevel::Medium);
    }

    #[test]
    fn legacy_order_without_optional_fields_loads() {
        let raw = json!({
            "id": 1,
            "user_id": 7,
            "items": [],
            "total": 0,
            "status": "pending_payment",
            "created_at": "2026-02-14T00:00:00Z"
        });
        let order: Order = serde_json::from_value(raw).unwrap();
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert!(order.payment_evidence.is_none());
    }
}
