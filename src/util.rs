//! Small shared helpers.

/// Truncate `text` to at most `max_chars` characters, appending an ellipsis
/// when anything was cut. Splits on character boundaries only.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push('…');
    out
}
