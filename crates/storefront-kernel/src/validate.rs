//! Per-field checks for dialog steps. Each returns the re-prompt text on failure.

use crate::text::normalize_description;
use storefront_contracts::{ProductKind, UserId};

pub const MIN_TITLE_CHARS: usize = 2;
pub const SKIP_MARKER: &str = "-";
pub const MAIN_MENU_LABEL: &str = "⬅️ Main menu";

const CANCEL_WORDS: &[&str] = &["cancel", "/cancel", "stop", "отмена"];

pub fn is_cancel(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    CANCEL_WORDS.contains(&input.as_str()) || input == MAIN_MENU_LABEL.to_lowercase()
}

pub fn title(input: &str) -> Result<String, String> {
    let title = input.trim();
    if title.chars().count() < MIN_TITLE_CHARS {
        return Err(format!(
            "Title must be at least {MIN_TITLE_CHARS} characters. Try again:"
        ));
    }
    Ok(title.to_string())
}

pub fn non_empty(input: &str, what: &str) -> Result<String, String> {
    let value = input.trim();
    if value.is_empty() {
        return Err(format!("{what} must not be empty. Try again:"));
    }
    Ok(value.to_string())
}

pub fn goods_kind(input: &str) -> Result<ProductKind, String> {
    match ProductKind::parse(input) {
        Some(kind @ (ProductKind::Weapon | ProductKind::Armor)) => Ok(kind),
        _ => Err("Type must be weapon or armor. Try again:".to_string()),
    }
}

pub fn price(input: &str) -> Result<u64, String> {
    match input.trim().parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value as u64),
        Ok(_) => Err("Price must be 0 or more. Try again:".to_string()),
        Err(_) => Err("Price must be a whole number. Try again:".to_string()),
    }
}

pub fn identifier(input: &str) -> Result<u64, String> {
    match input.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err("Enter the ID as a positive number:".to_string()),
    }
}

pub fn user_id(input: &str) -> Result<UserId, String> {
    input
        .trim()
        .parse::<UserId>()
        .map_err(|_| "Enter the user ID as a number:".to_string())
}

/// `-` clears; anything else is normalised.
pub fn optional_description(input: &str) -> String {
    if input.trim() == SKIP_MARKER {
        return String::new();
    }
    normalize_description(input)
}

pub fn support_username(input: &str) -> Result<String, String> {
    let name = input.trim().trim_start_matches('@').trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err("Send a username like @helpdesk:".to_string());
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_case_insensitive() {
        assert!(is_cancel("CANCEL"));
        assert!(is_cancel(" /cancel "));
        assert!(is_cancel("⬅️ main menu"));
        assert!(!is_cancel("cancellation policy"));
    }

    #[test]
    fn title_needs_two_chars() {
        assert!(title("A").is_err());
        assert_eq!(title(" Ak ").unwrap(), "Ak");
    }

    #[test]
    fn price_must_be_non_negative_integer() {
        assert_eq!(price("0"), Ok(0));
        assert!(price("-1").is_err());
        assert!(price("12.5").is_err());
        assert!(price("ten").is_err());
    }

    #[test]
    fn goods_kind_excludes_escort() {
        assert_eq!(goods_kind("ARMOR"), Ok(ProductKind::Armor));
        assert!(goods_kind("escort").is_err());
    }

    #[test]
    fn dash_clears_description() {
        assert_eq!(optional_description(" - "), "");
        assert_eq!(optional_description("fine   steel"), "fine steel");
    }

    #[test]
    fn identifiers_are_positive() {
        assert!(identifier("0").is_err());
        assert_eq!(identifier("7"), Ok(7));
        assert_eq!(user_id("-100"), Ok(-100));
    }
}
