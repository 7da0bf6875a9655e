//! Shared utility functions for the vanguard crate.

use sha2::{Digest, Sha256};

/// Extract a JSON value from text that may contain other content.
/// Uses bracket-counting to find the outermost JSON object or array.
pub fn extract_json_value(text: &str) -> Option<String> {
    let obj = text.find('{');
    let arr = text.find('[');
    let (start, open, close) = match (obj, arr) {
        (Some(o), Some(a)) if a < o => (a, '[', ']'),
        (Some(o), _) => (o, '{', '}'),
        (None, Some(a)) => (a, '[', ']'),
        (None, None) => return None,
    };

    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + ch.len_utf8();
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Strip surrounding markdown code fences from LLM output.
///
/// Handles ```json ... ``` and bare ``` ... ``` blocks; text without fences
/// is returned trimmed but otherwise unchanged.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence line.
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => return trimmed,
    };
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// Collapse a campaign id into a filesystem-safe slug: leading slash
/// stripped, every non-alphanumeric run replaced by a single underscore.
pub fn slugify(id: &str) -> String {
    let mut slug = String::with_capacity(id.len());
    let mut last_was_sep = false;
    for ch in id.trim_start_matches('/').chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_sep = false;
        } else if !last_was_sep && !slug.is_empty() {
            slug.push('_');
            last_was_sep = true;
        }
    }
    if slug.ends_with('_') {
        slug.pop();
    }
    slug
}

/// Stable hex hash of a key, truncated to `len` characters.
pub fn short_hash(key: &str, len: usize) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.chars().take(len).collect()
}

/// Normalise a path to forward slashes for persistence.
pub fn normalise_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Truncate a string to at most `max` bytes on a char boundary, appending a
/// marker when content was dropped.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_value_object() {
        let text = r#"Here is the plan: {"title": "x"} done"#;
        assert_eq!(
            extract_json_value(text),
            Some(r#"{"title": "x"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_value_array() {
        let text = r#"[{"a": 1}, {"b": 2}]"#;
        assert_eq!(extract_json_value(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_value_braces_in_strings() {
        let text = r#"{"cmd": "echo {x}"}"#;
        assert_eq!(extract_json_value(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_value_unclosed() {
        assert_eq!(extract_json_value(r#"{"key": "value""#), None);
        assert_eq!(extract_json_value("no json"), None);
    }

    #[test]
    fn test_strip_code_fences() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");

        let bare = "```\n[1, 2]\n```";
        assert_eq!(strip_code_fences(bare), "[1, 2]");

        let plain = "  {\"a\": 1}  ";
        assert_eq!(strip_code_fences(plain), "{\"a\": 1}");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("/campaign/abc-123"), "campaign_abc_123");
        assert_eq!(slugify("plain"), "plain");
        assert_eq!(slugify("a//b!!c"), "a_b_c");
    }

    #[test]
    fn test_short_hash_stable() {
        let a = short_hash("1|test|1|./internal/a/...", 10);
        let b = short_hash("1|test|1|./internal/a/...", 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_ne!(a, short_hash("2|test|1|./internal/a/...", 10));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short", 100), "short");
        let long = "x".repeat(50);
        let truncated = truncate_output(&long, 10);
        assert!(truncated.starts_with("xxxxxxxxxx"));
        assert!(truncated.ends_with("[truncated]"));
    }
}
