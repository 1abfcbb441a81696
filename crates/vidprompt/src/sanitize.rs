//! Instruction text hygiene for user-supplied prompts.

use std::sync::LazyLock;

use regex::Regex;

/// Longest instruction accepted, in characters.
pub const MAX_PROMPT_CHARS: usize = 12_000;

// Tab, LF and CR survive.
static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("CONTROL_CHARS regex should compile")
});

/// Strip control characters, trim, and cap at [`MAX_PROMPT_CHARS`].
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_prompt(raw: &str) -> Option<String> {
    let stripped = CONTROL_CHARS.replace_all(raw, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return None;
    }
    let capped: String = trimmed.chars().take(MAX_PROMPT_CHARS).collect();
    Some(capped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_control_keeps_whitespace() {
        let cleaned = sanitize_prompt("  a\u{0}b\tc\r\nd\u{7f}e\u{1b}  ").unwrap();
        assert_eq!(cleaned, "ab\tc\r\nde");
    }

    #[test]
    fn test_empty_after_cleaning() {
        assert_eq!(sanitize_prompt(""), None);
        assert_eq!(sanitize_prompt(" \n\t "), None);
        assert_eq!(sanitize_prompt("\u{1}\u{2}\u{3}"), None);
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_PROMPT_CHARS + 50);
        let cleaned = sanitize_prompt(&long).unwrap();
        assert_eq!(cleaned.chars().count(), MAX_PROMPT_CHARS);
    }
}
