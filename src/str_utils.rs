//! Char-boundary helpers for windowing and span slicing over UTF-8 text.

use std::borrow::Cow;

/// Prefix of at most `max_chars` characters, never splitting a UTF-8
/// sequence.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    let end = s
        .char_indices()
        .nth(max_chars)
        .map_or(s.len(), |(idx, _)| idx);
    &s[..end]
}

/// First `n` characters, borrowing when the input is already short enough.
pub fn first_n_chars_lossy(s: &str, n: usize) -> Cow<'_, str> {
    let prefix = prefix_chars(s, n);
    if prefix.len() == s.len() {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(prefix.to_string())
    }
}

/// Byte-offset slice that returns None instead of panicking when an offset
/// is out of range or falls inside a multi-byte character.
pub fn slice_bytes_safe(s: &str, start: usize, end: usize) -> Option<&str> {
    s.get(start..end)
}

/// Largest char boundary at or below `idx`.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    (0..=idx).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
