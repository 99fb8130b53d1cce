//! Character-safe truncation helpers.
//!
//! Limits are counted in `char`s, never bytes, so multi-byte output from a
//! sandbox or tool server is never split inside a code point.

/// Return at most `max_chars` characters of `input`.
#[must_use]
pub fn take_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Truncate `input` to `max_chars` characters, appending `marker` when
/// anything was cut.
#[must_use]
pub fn truncate_with_marker(input: &str, max_chars: usize, marker: &str) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out = take_chars(input, max_chars).to_string();
    out.push_str(marker);
    out
}
