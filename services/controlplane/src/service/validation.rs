//! Input validation and normalization.
//!
//! Formats accepted by the service layer:
//! - slug: `^[a-z0-9-]+$`
//! - client id: `^[a-z0-9_\-]{3,64}$`
//! - scope name: `^[a-z0-9](?:[a-z0-9:_.\-]{0,62}[a-z0-9])?$`
//! - redirect URI: `https://...`, or `http://localhost...` / `http://127.0.0.1...`

pub fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

pub fn valid_client_id(client_id: &str) -> bool {
    (3..=64).contains(&client_id.len())
        && client_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

pub fn valid_scope_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let inner = |b: u8| edge(b) || matches!(b, b':' | b'_' | b'.' | b'-');
    match bytes {
        [] => false,
        [only] => edge(*only),
        [first, middle @ .., last] => {
            bytes.len() <= 64 && edge(*first) && edge(*last) && middle.iter().all(|b| inner(*b))
        }
    }
}

pub fn valid_redirect_uri(uri: &str) -> bool {
    if let Some(rest) = uri.strip_prefix("https://") {
        return !rest.is_empty();
    }
    uri.starts_with("http://localhost") || uri.starts_with("http://127.0.0.1")
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trim, drop empties and duplicates, keep first-seen order.
pub fn unique_strings(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|seen| seen == value) {
            out.push(value.to_string());
        }
    }
    out
}
