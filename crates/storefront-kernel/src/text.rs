//! Text shaping helpers shared by catalog rendering and the verification flow.

use regex::Regex;
use std::sync::OnceLock;

pub const DESCRIPTION_PREVIEW_CHARS: usize = 160;

fn self_reference_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bas an ai( language model)?\b[,:]?",
            r"(?i)\bi am an ai( language model)?\b[,.]?",
            r"(?i)\b(generated|written) by (an )?ai\b",
            r"(?i)\bartificial intelligence\b",
            r"(?i)\bchat\s?gpt\b",
            r"(?i)\bllama\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

fn blank_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").expect("static regex"))
}

fn newline_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("static regex"))
}

/// Strips model self-references and collapses runs of blanks and of more
/// than two newlines.
pub fn normalize_description(raw: &str) -> String {
    let mut text = raw.replace("\r\n", "\n");
    for pattern in self_reference_patterns() {
        text = pattern.replace_all(&text, "").into_owned();
    }
    let text = blank_run().replace_all(&text, " ");
    let text = newline_run().replace_all(&text, "\n\n");
    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

/// Cuts `text` to `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Returns the inside of the first ```` ```lang ```` block, or the whole
/// trimmed text when no such block exists.
pub fn extract_fenced_block<'a>(text: &'a str, lang: &str) -> &'a str {
    let marker = format!("```{lang}");
    let Some(start) = text.find(&marker) else {
        return text.trim();
    };
    let body_start = start + marker.len();
    match text[body_start..].find("```") {
        Some(end) => text[body_start..body_start + end].trim(),
        None => text[body_start..].trim(),
    }
}

/// Removes a surrounding markdown code fence (with optional language tag).
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    let rest = match rest.find('\n') {
        Some(newline) if rest[..newline].chars().all(|c| c.is_ascii_alphanumeric()) => {
            &rest[newline + 1..]
        }
        _ => rest,
    };
    rest.trim()
}

/// Verdict used when the vision service cannot be reached or answers with nothing.
pub fn synthetic_verdict() -> String {
    [
        "Status: insufficient data",
        "Confidence: low",
        "Amount match: unknown",
        "Found amount: -",
        "Currency: -",
        "Recipient: -",
        "Operation status: -",
        "Date/time: -",
        "Analysis: analysis error, the image could not be evaluated",
        "Conclusion: manual review required",
        "Recommendation: check the payment by hand before accepting",
    ]
    .join("\n")
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_self_references_and_whitespace() {
        let raw = "As an AI, I describe:   sharp\t\tblade.\n\n\n\nMade by ChatGPT";
        assert_eq!(normalize_description(raw), "I describe: sharp blade.\n\nMade by");
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        assert_eq!(preview("short", 160), "short");
        assert_eq!(preview("привет мир", 6), "привет…");
    }

    #[test]
    fn truncate_never_splits_code_points() {
        assert_eq!(truncate_chars("ёжик", 2), "ёж");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn extracts_first_block_or_whole_text() {
        let raw = "intro\n```bash\nStatus: confirmed\n```\ntrailer";
        assert_eq!(extract_fenced_block(raw, "bash"), "Status: confirmed");
        assert_eq!(extract_fenced_block("  plain  ", "bash"), "plain");
        assert_eq!(extract_fenced_block("```bash\nopen", "bash"), "open");
    }

    #[test]
    fn strips_json_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence(" {} "), "{}");
    }

    #[test]
    fn synthetic_verdict_is_low_confidence() {
        let verdict = synthetic_verdict();
        assert!(verdict.contains("insufficient data"));
        assert!(verdict.contains("Confidence: low"));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<b>&"), "&lt;b&gt;&amp;");
    }
}
