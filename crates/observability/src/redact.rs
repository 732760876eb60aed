//! Identifier sanitisation for log fields.
//!
//! Tenant ids and operation names end up in transaction boundary events. They are
//! user-influenced strings, so they are clipped and restricted to a safe alphabet
//! before being attached to a span or event.

/// Maximum number of characters kept from a sanitised identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Number of leading characters of a tenant id that stay visible.
pub const TENANT_VISIBLE_PREFIX: usize = 8;

/// Restrict `raw` to `[A-Za-z0-9_.:-]` and clip it to [`MAX_IDENTIFIER_LEN`].
///
/// Disallowed characters (whitespace, quotes, control characters, newlines) are
/// replaced with `_` so a crafted value cannot forge extra log fields or lines.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .take(MAX_IDENTIFIER_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if raw.chars().count() > MAX_IDENTIFIER_LEN {
        out.push_str("...");
    }
    out
}

/// Mask a tenant identifier, keeping only a short prefix for correlation.
pub fn mask_tenant(raw: &str) -> String {
    let clean = sanitize_identifier(raw);
    if clean.chars().count() <= TENANT_VISIBLE_PREFIX {
        return clean;
    }
    let prefix: String = clean.chars().take(TENANT_VISIBLE_PREFIX).collect();
    format!("{prefix}***")
}
