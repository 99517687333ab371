//! Phone number cleanup.

/// Normalize a number to E.123 international form.
///
/// Drops every character except `+` and digits; the result must be a `+`
/// followed by at least one digit.
pub fn normalize_number(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c == '+' || c.is_ascii_digit())
        .collect();

    let digits = cleaned.strip_prefix('+')?;
    let valid = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());

    valid.then_some(cleaned)
}
