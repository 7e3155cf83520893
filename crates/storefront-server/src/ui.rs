//! Button grammar and message rendering. Every callback payload the bot emits
//! round-trips through [`ButtonCommand`].

use chrono::Duration;
use storefront_contracts::{
    ActionEnvelope, ActionOutcome, Button, CatalogFamily, Keyboard, LogEntry, Order, OrderId,
    Product, ProductId, ProductKind, RiskLevel, UserId,
};
use storefront_kernel::text::{escape_html, preview, DESCRIPTION_PREVIEW_CHARS};
use storefront_kernel::validate::MAIN_MENU_LABEL;

pub const PAGE_SIZE: usize = 6;
pub const LOG_TAIL_LIMIT: usize = 50;
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogWindow {
    Hour,
    Day,
    Week,
    All,
}

impl LogWindow {
    fn token(self) -> &'static str {
        match self {
            LogWindow::Hour => "1h",
            LogWindow::Day => "24h",
            LogWindow::Week => "7d",
            LogWindow::All => "all",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "1h" => Some(LogWindow::Hour),
            "24h" => Some(LogWindow::Day),
            "7d" => Some(LogWindow::Week),
            "all" => Some(LogWindow::All),
            _ => None,
        }
    }

    pub fn duration(self) -> Option<Duration> {
        match self {
            LogWindow::Hour => Some(Duration::hours(1)),
            LogWindow::Day => Some(Duration::hours(24)),
            LogWindow::Week => Some(Duration::days(7)),
            LogWindow::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderControl {
    Verify,
    DeepVerify,
    Message,
    Reject,
    Accept,
}

impl OrderControl {
    fn token(self) -> &'static str {
        match self {
            OrderControl::Verify => "verify",
            OrderControl::DeepVerify => "deep",
            OrderControl::Message => "message",
            OrderControl::Reject => "reject",
            OrderControl::Accept => "accept",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "verify" => Some(OrderControl::Verify),
            "deep" => Some(OrderControl::DeepVerify),
            "message" => Some(OrderControl::Message),
            "reject" => Some(OrderControl::Reject),
            "accept" => Some(OrderControl::Accept),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Menu,
    Products,
    Escorts,
    Orders,
    Settings,
    Admins,
    Stats,
    Operator,
    Broadcast,
    Restart,
    ClearOrders,
    Logs(LogWindow),
    AddProduct,
    AddEscort,
    Delete(CatalogFamily),
    Price(CatalogFamily),
    Describe,
    Password,
    Phone,
    Support,
    Grant,
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonCommand {
    MainMenu,
    Shop,
    Catalog { kind: ProductKind, page: usize },
    Product(ProductId),
    CartAdd(ProductId),
    CartAddById(Option<ProductKind>),
    CartOpen,
    CartClear,
    Checkout,
    PaymentInfo,
    About,
    Help,
    Dispute(OrderId),
    DisputeReply { order_id: OrderId, user_id: UserId },
    Admin(AdminCommand),
    Order(OrderControl, OrderId),
    PlanApply(String),
    PlanDeny(String),
}

impl ButtonCommand {
    pub fn parse(data: &str) -> Option<Self> {
        let parts: Vec<&str> = data.trim().split(':').collect();
        let command = match parts.as_slice() {
            ["menu"] => ButtonCommand::MainMenu,
            ["shop"] => ButtonCommand::Shop,
            ["catalog", kind, page] => ButtonCommand::Catalog {
                kind: ProductKind::parse(kind)?,
                page: page.parse().ok()?,
            },
            ["product", id] => ButtonCommand::Product(id.parse().ok()?),
            ["cart", "add", id] => ButtonCommand::CartAdd(id.parse().ok()?),
            ["cart", "by_id", "any"] => ButtonCommand::CartAddById(None),
            ["cart", "by_id", kind] => ButtonCommand::CartAddById(Some(ProductKind::parse(kind)?)),
            ["cart", "open"] => ButtonCommand::CartOpen,
            ["cart", "clear"] => ButtonCommand::CartClear,
            ["cart", "checkout"] => ButtonCommand::Checkout,
            ["pay"] => ButtonCommand::PaymentInfo,
            ["about"] => ButtonCommand::About,
            ["help"] => ButtonCommand::Help,
            ["dispute", id] => ButtonCommand::Dispute(id.parse().ok()?),
            ["dispute_reply", order, user] => ButtonCommand::DisputeReply {
                order_id: order.parse().ok()?,
                user_id: user.parse().ok()?,
            },
            ["admin"] => ButtonCommand::Admin(AdminCommand::Menu),
            ["admin", "logs", window] => {
                ButtonCommand::Admin(AdminCommand::Logs(LogWindow::parse(window)?))
            }
            ["admin", "delete", family] => {
                ButtonCommand::Admin(AdminCommand::Delete(CatalogFamily::parse(family)?))
            }
            ["admin", "price", family] => {
                ButtonCommand::Admin(AdminCommand::Price(CatalogFamily::parse(family)?))
            }
            ["admin", name] => ButtonCommand::Admin(match *name {
                "products" => AdminCommand::Products,
                "escorts" => AdminCommand::Escorts,
                "orders" => AdminCommand::Orders,
                "settings" => AdminCommand::Settings,
                "admins" => AdminCommand::Admins,
                "stats" => AdminCommand::Stats,
                "operator" => AdminCommand::Operator,
                "broadcast" => AdminCommand::Broadcast,
                "restart" => AdminCommand::Restart,
                "clear_orders" => AdminCommand::ClearOrders,
                "add_product" => AdminCommand::AddProduct,
                "add_escort" => AdminCommand::AddEscort,
                "describe" => AdminCommand::Describe,
                "password" => AdminCommand::Password,
                "phone" => AdminCommand::Phone,
                "support" => AdminCommand::Support,
                "grant" => AdminCommand::Grant,
                "revoke" => AdminCommand::Revoke,
                _ => return None,
            }),
            ["order", control, id] => {
                ButtonCommand::Order(OrderControl::parse(control)?, id.parse().ok()?)
            }
            ["plan", "apply", key] if !key.is_empty() => ButtonCommand::PlanApply(key.to_string()),
            ["plan", "deny", key] if !key.is_empty() => ButtonCommand::PlanDeny(key.to_string()),
            _ => return None,
        };
        Some(command)
    }

    pub fn data(&self) -> String {
        match self {
            ButtonCommand::MainMenu => "menu".to_string(),
            ButtonCommand::Shop => "shop".to_string(),
            ButtonCommand::Catalog { kind, page } => format!("catalog:{}:{page}", kind.as_str()),
            ButtonCommand::Product(id) => format!("product:{id}"),
            ButtonCommand::CartAdd(id) => format!("cart:add:{id}"),
            ButtonCommand::CartAddById(kind) => format!(
                "cart:by_id:{}",
                kind.map(ProductKind::as_str).unwrap_or("any")
            ),
            ButtonCommand::CartOpen => "cart:open".to_string(),
            ButtonCommand::CartClear => "cart:clear".to_string(),
            ButtonCommand::Checkout => "cart:checkout".to_string(),
            ButtonCommand::PaymentInfo => "pay".to_string(),
            ButtonCommand::About => "about".to_string(),
            ButtonCommand::Help => "help".to_string(),
            ButtonCommand::Dispute(id) => format!("dispute:{id}"),
            ButtonCommand::DisputeReply { order_id, user_id } => {
                format!("dispute_reply:{order_id}:{user_id}")
            }
            ButtonCommand::Admin(cmd) => match cmd {
                AdminCommand::Menu => "admin".to_string(),
                AdminCommand::Products => "admin:products".to_string(),
                AdminCommand::Escorts => "admin:escorts".to_string(),
                AdminCommand::Orders => "admin:orders".to_string(),
                AdminCommand::Settings => "admin:settings".to_string(),
                AdminCommand::Admins => "admin:admins".to_string(),
                AdminCommand::Stats => "admin:stats".to_string(),
                AdminCommand::Operator => "admin:operator".to_string(),
                AdminCommand::Broadcast => "admin:broadcast".to_string(),
                AdminCommand::Restart => "admin:restart".to_string(),
                AdminCommand::ClearOrders => "admin:clear_orders".to_string(),
                AdminCommand::Logs(w) => format!("admin:logs:{}", w.token()),
                AdminCommand::AddProduct => "admin:add_product".to_string(),
                AdminCommand::AddEscort => "admin:add_escort".to_string(),
                AdminCommand::Delete(f) => format!("admin:delete:{}", f.as_str()),
                AdminCommand::Price(f) => format!("admin:price:{}", f.as_str()),
                AdminCommand::Describe => "admin:describe".to_string(),
                AdminCommand::Password => "admin:password".to_string(),
                AdminCommand::Phone => "admin:phone".to_string(),
                AdminCommand::Support => "admin:support".to_string(),
                AdminCommand::Grant => "admin:grant".to_string(),
                AdminCommand::Revoke => "admin:revoke".to_string(),
            },
            ButtonCommand::Order(control, id) => format!("order:{}:{id}", control.token()),
            ButtonCommand::PlanApply(key) => format!("plan:apply:{key}"),
            ButtonCommand::PlanDeny(key) => format!("plan:deny:{key}"),
        }
    }

    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            ButtonCommand::Admin(_)
                | ButtonCommand::Order(..)
                | ButtonCommand::DisputeReply { .. }
                | ButtonCommand::PlanApply(_)
                | ButtonCommand::PlanDeny(_)
        )
    }
}

fn button(label: &str, command: ButtonCommand) -> Button {
    Button::callback(label, command.data())
}

fn back_to_menu() -> Button {
    button(MAIN_MENU_LABEL, ButtonCommand::MainMenu)
}

fn back_to_admin() -> Button {
    button("⬅️ Admin panel", ButtonCommand::Admin(AdminCommand::Menu))
}

pub fn kind_label(kind: ProductKind) -> &'static str {
    match kind {
        ProductKind::Weapon => "Weapons",
        ProductKind::Armor => "Armor",
        ProductKind::Escort => "Escorts",
    }
}

pub fn main_menu(is_admin: bool) -> Keyboard {
    let keyboard = Keyboard::new()
        .row(vec![
            button("🛒 Shop", ButtonCommand::Shop),
            button(
                "🛡 Escorts",
                ButtonCommand::Catalog {
                    kind: ProductKind::Escort,
                    page: 0,
                },
            ),
        ])
        .row(vec![
            button("🧺 Cart", ButtonCommand::CartOpen),
            button("💳 Payment", ButtonCommand::PaymentInfo),
        ])
        .row(vec![
            button("ℹ️ About", ButtonCommand::About),
            button("❓ Help", ButtonCommand::Help),
        ]);
    if is_admin {
        keyboard.button(back_to_admin())
    } else {
        keyboard
    }
}

pub fn shop_menu() -> Keyboard {
    let goods: Vec<Button> = ProductKind::ALL
        .into_iter()
        .filter(|k| CatalogFamily::Goods.contains(*k))
        .map(|kind| button(kind_label(kind), ButtonCommand::Catalog { kind, page: 0 }))
        .collect();
    Keyboard::new()
        .row(goods)
        .button(button("🔢 Add by ID", ButtonCommand::CartAddById(None)))
        .button(back_to_menu())
}

pub fn admin_menu() -> Keyboard {
    let admin = |label: &str, cmd| button(label, ButtonCommand::Admin(cmd));
    Keyboard::new()
        .row(vec![
            admin("📦 Products", AdminCommand::Products),
            admin("🛡 Escorts", AdminCommand::Escorts),
        ])
        .row(vec![
            admin("🧾 Orders", AdminCommand::Orders),
            admin("📊 Stats", AdminCommand::Stats),
        ])
        .row(vec![
            admin("🤖 AI operator", AdminCommand::Operator),
            admin("📣 Broadcast", AdminCommand::Broadcast),
        ])
        .row(vec![
            admin("⚙️ Settings", AdminCommand::Settings),
            admin("👥 Admins", AdminCommand::Admins),
        ])
        .row(vec![
            admin("📜 Logs 1h", AdminCommand::Logs(LogWindow::Hour)),
            admin("24h", AdminCommand::Logs(LogWindow::Day)),
            admin("7d", AdminCommand::Logs(LogWindow::Week)),
            admin("all", AdminCommand::Logs(LogWindow::All)),
        ])
        .row(vec![
            admin("🗑 Clear orders", AdminCommand::ClearOrders),
            admin("🔄 Restart", AdminCommand::Restart),
        ])
        .button(back_to_menu())
}

pub fn catalog_admin_menu(family: CatalogFamily) -> Keyboard {
    let admin = |label: &str, cmd| button(label, ButtonCommand::Admin(cmd));
    let add = match family {
        CatalogFamily::Goods => admin("➕ Add product", AdminCommand::AddProduct),
        CatalogFamily::Escort => admin("➕ Add escort", AdminCommand::AddEscort),
    };
    Keyboard::new()
        .row(vec![add, admin("❌ Delete", AdminCommand::Delete(family))])
        .row(vec![
            admin("💲 Change price", AdminCommand::Price(family)),
            admin("📝 Description", AdminCommand::Describe),
        ])
        .button(back_to_admin())
}

pub fn settings_menu() -> Keyboard {
    let admin = |label: &str, cmd| button(label, ButtonCommand::Admin(cmd));
    Keyboard::new()
        .button(admin("🔑 Change password", AdminCommand::Password))
        .button(admin("📱 Payment phone", AdminCommand::Phone))
        .button(admin("👤 Support handle", AdminCommand::Support))
        .button(back_to_admin())
}

pub fn admins_menu() -> Keyboard {
    Keyboard::new()
        .row(vec![
            button("➕ Grant", ButtonCommand::Admin(AdminCommand::Grant)),
            button("➖ Revoke", ButtonCommand::Admin(AdminCommand::Revoke)),
        ])
        .button(back_to_admin())
}

pub fn catalog_page(
    products: &[Product],
    kind: ProductKind,
    page: usize,
    currency: &str,
) -> (String, Keyboard) {
    let listed: Vec<&Product> = products.iter().filter(|p| p.kind == kind).collect();
    if listed.is_empty() {
        return (
            format!("{}: nothing here yet.", kind_label(kind)),
            Keyboard::new().button(back_to_menu()),
        );
    }
    let pages = listed.len().div_ceil(PAGE_SIZE);
    let page = page.min(pages - 1);
    let start = page * PAGE_SIZE;
    let mut keyboard = Keyboard::new();
    for p in listed.iter().skip(start).take(PAGE_SIZE) {
        keyboard = keyboard.button(button(
            &format!("{} · {} {}", p.title, p.price, currency),
            ButtonCommand::Product(p.id),
        ));
    }
    let mut nav = Vec::new();
    if page > 0 {
        nav.push(button(
            "⬅️",
            ButtonCommand::Catalog {
                kind,
                page: page - 1,
            },
        ));
    }
    if page + 1 < pages {
        nav.push(button(
            "➡️",
            ButtonCommand::Catalog {
                kind,
                page: page + 1,
            },
        ));
    }
    let keyboard = keyboard
        .row(nav)
        .button(button("🔢 Add by ID", ButtonCommand::CartAddById(Some(kind))))
        .button(back_to_menu());
    (
        format!(
            "<b>{}</b> (page {}/{})",
            kind_label(kind),
            page + 1,
            pages
        ),
        keyboard,
    )
}

pub fn product_card(product: &Product, currency: &str) -> (String, Keyboard) {
    let mut text = format!(
        "<b>{}</b>\nID: {}\nCategory: {}\nPrice: {} {}",
        escape_html(&product.title),
        product.id,
        escape_html(&product.category),
        product.price,
        currency
    );
    if !product.description.is_empty() {
        text.push_str("\n\n");
        text.push_str(&escape_html(&preview(
            &product.description,
            DESCRIPTION_PREVIEW_CHARS,
        )));
    }
    let keyboard = Keyboard::new()
        .button(button("➕ Add to cart", ButtonCommand::CartAdd(product.id)))
        .row(vec![
            button(
                "⬅️ Back",
                ButtonCommand::Catalog {
                    kind: product.kind,
                    page: 0,
                },
            ),
            button("🧺 Cart", ButtonCommand::CartOpen),
        ]);
    (text, keyboard)
}

pub fn cart_view(items: &[Product], currency: &str) -> (String, Keyboard) {
    if items.is_empty() {
        return (
            "Your cart is empty.".to_string(),
            Keyboard::new().button(back_to_menu()),
        );
    }
    let mut lines = vec!["<b>Your cart</b>".to_string()];
    for (n, p) in items.iter().enumerate() {
        lines.push(format!(
            "{}. {} · {} {}",
            n + 1,
            escape_html(&p.title),
            p.price,
            currency
        ));
    }
    let total: u64 = items.iter().map(|p| p.price).sum();
    lines.push(format!("\nTotal: <b>{total} {currency}</b>"));
    let keyboard = Keyboard::new()
        .row(vec![
            button("✅ Checkout", ButtonCommand::Checkout),
            button("🗑 Clear", ButtonCommand::CartClear),
        ])
        .button(back_to_menu());
    (lines.join("\n"), keyboard)
}

pub fn order_summary(order: &Order, currency: &str) -> String {
    let who = if order.username.is_empty() {
        format!("id {}", order.user_id)
    } else {
        format!("@{} (id {})", escape_html(&order.username), order.user_id)
    };
    let mut lines = vec![
        format!("<b>Order #{}</b>", order.id),
        format!("Customer: {who}"),
        format!("Status: {}", order.status.as_str()),
    ];
    for p in &order.items {
        lines.push(format!(
            "• {} ({}) · {} {}",
            escape_html(&p.title),
            p.kind.as_str(),
            p.price,
            currency
        ));
    }
    lines.push(format!("Total: <b>{} {}</b>", order.total, currency));
    if let Some(reason) = &order.reject_reason {
        lines.push(format!("Reject reason: {}", escape_html(reason)));
    }
    lines.join("\n")
}

pub fn order_controls(order_id: OrderId) -> Keyboard {
    let control = |label: &str, c| button(label, ButtonCommand::Order(c, order_id));
    Keyboard::new()
        .row(vec![
            control("🔍 Verify", OrderControl::Verify),
            control("🔬 Deep verify", OrderControl::DeepVerify),
        ])
        .row(vec![
            control("✉️ Message client", OrderControl::Message),
            control("✅ Accept", OrderControl::Accept),
        ])
        .button(control("❌ Reject", OrderControl::Reject))
}

pub fn dispute_controls(order_id: OrderId) -> Keyboard {
    Keyboard::new().button(button("💬 Dispute", ButtonCommand::Dispute(order_id)))
}

pub fn dispute_reply_controls(order_id: OrderId, user_id: UserId) -> Keyboard {
    Keyboard::new().button(button(
        "↩️ Reply",
        ButtonCommand::DisputeReply { order_id, user_id },
    ))
}

pub fn plan_message(summary: &str, risk: RiskLevel, actions: &[ActionEnvelope]) -> String {
    let risk_line = match risk {
        RiskLevel::High => "⚠️ <b>RISK: HIGH</b> ⚠️".to_string(),
        other => format!("Risk: {}", other.as_str()),
    };
    let mut lines = vec![
        "<b>Proposed plan</b>".to_string(),
        escape_html(summary),
        risk_line,
        String::new(),
    ];
    for (n, action) in actions.iter().enumerate() {
        lines.push(format!(
            "{}. <code>{}</code> {}",
            n + 1,
            escape_html(&action.action_type),
            escape_html(&action.params.to_string())
        ));
    }
    lines.join("\n")
}

pub fn plan_controls(key: &str) -> Keyboard {
    Keyboard::new().row(vec![
        button("✅ Confirm", ButtonCommand::PlanApply(key.to_string())),
        button("❌ Deny", ButtonCommand::PlanDeny(key.to_string())),
    ])
}

pub fn outcomes_message(outcomes: &[ActionOutcome]) -> String {
    let body = serde_json::to_string_pretty(outcomes).unwrap_or_else(|_| "[]".to_string());
    format!("<b>Results</b>\n<pre>{}</pre>", escape_html(&body))
}

pub fn log_lines(entries: &[LogEntry]) -> String {
    if entries.is_empty() {
        return "No journal entries in this window.".to_string();
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|e| {
            let user = e.user_id.map(|u| format!(" user={u}")).unwrap_or_default();
            let extra = if e.extra.is_empty() {
                String::new()
            } else {
                format!(" {}", serde_json::Value::Object(e.extra.clone()))
            };
            format!(
                "{} {}{}{}",
                e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                e.event_type,
                user,
                extra
            )
        })
        .collect();
    format!("<pre>{}</pre>", escape_html(&lines.join("\n")))
}
