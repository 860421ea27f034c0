//! UTF-8 safe string helpers.

/// Largest byte index <= `i` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    (0..=i).rev().find(|&pos| s.is_char_boundary(pos)).unwrap_or(0)
}

/// Truncate to at most `max_bytes`, never splitting a codepoint.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    &s[..floor_char_boundary(s, max_bytes)]
}

/// One-line preview: whitespace runs collapse to a single space and the
/// result is cut to `max_bytes` with a trailing `...` when it was longer.
pub fn preview(text: &str, max_bytes: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= max_bytes {
        return flat;
    }
    let cut = truncate_str(&flat, max_bytes.saturating_sub(3));
    format!("{cut}...")
}
