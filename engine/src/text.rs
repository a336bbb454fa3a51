//! Char-boundary-safe slicing used when excerpting logs and sources for prompts.

/// Largest char boundary `<= idx`.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary `>= idx`.
pub fn ceil_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// At most `max` leading bytes of `s`.
pub fn head(s: &str, max: usize) -> &str {
    &s[..floor_char_boundary(s, max)]
}

/// At most `max` trailing bytes of `s`.
pub fn tail(s: &str, max: usize) -> &str {
    &s[ceil_char_boundary(s, s.len().saturating_sub(max))..]
}

/// Keep the head and tail of an oversized text, joined by `marker`.
///
/// Returns `None` when `s` is no longer than `limit`.
pub fn truncate_middle(s: &str, limit: usize, keep: usize, marker: &str) -> Option<String> {
    if s.len() <= limit {
        return None;
    }
    Some(format!("{}{}{}", head(s, keep), marker, tail(s, keep)))
}
