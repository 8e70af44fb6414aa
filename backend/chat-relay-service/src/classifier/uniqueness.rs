//! Intros must not repeat text that was already sent as an intro within the past week.

/// Lowercase, keep only letters and digits, collapse runs of the same character.
pub fn normalize(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut last = None;
    for c in text.chars().flat_map(char::to_lowercase) {
        if !c.is_alphanumeric() || last == Some(c) {
            continue;
        }
        normalized.push(c);
        last = Some(c);
    }
    normalized
}

pub fn intro_hash(text: &str) -> String {
    format!("{:x}", md5::compute(normalize(text).as_bytes()))
}
