//! Utility types and functions shared across the gateway.
//!
//! - [`b64`] - Base64 encoding/decoding for the `X-PAYMENT` header payload
//! - [`sanitize_tenant_id`] - normalization of caller-supplied tenant labels
//! - [`render_memo`] - memo template expansion for crypto transfers

pub mod b64;

/// Maximum length of a sanitized tenant identifier.
const TENANT_ID_MAX_LEN: usize = 64;

/// Normalize a caller-supplied tenant identifier to `[a-z0-9\-_]{0,64}`.
///
/// Uppercase ASCII is lowercased, every other character outside the allowed
/// set is dropped, and the result is truncated to 64 characters. The function
/// is idempotent: sanitizing an already-sanitized value returns it unchanged.
pub fn sanitize_tenant_id(raw: &str) -> String {
    raw.chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            _ => None,
        })
        .take(TENANT_ID_MAX_LEN)
        .collect()
}

/// Expand a product memo template.
///
/// Recognized placeholders: `{resource}` and `{nonce}`. Unknown placeholders
/// are left untouched so operators can spot template typos in delivered memos.
pub fn render_memo(template: &str, resource: &str, nonce: &str) -> String {
    template
        .replace("{resource}", resource)
        .replace("{nonce}", nonce)
}
