//! Phone number normalization for WhatsApp addresses.

/// Shortest digit string treated as a usable WhatsApp number.
const MIN_DIGITS: usize = 8;
/// E.164 upper bound.
const MAX_DIGITS: usize = 15;

/// Strip formatting (spaces, dashes, parentheses, leading `+`) and return the
/// bare digit string, or `None` when the number cannot be dialled.
pub fn normalize(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.trim_start_matches("00").to_string();
    if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
        return None;
    }
    Some(digits)
}
