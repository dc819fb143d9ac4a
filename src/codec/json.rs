/// A minimal, tolerant JSON field lookup (§4.1): finds `"key"`, then the
/// first `:`, then a string or primitive literal up to the next `,` or `}`.
/// Not a general parser — used only to read the `model` field out of a
/// request body without buffering a full JSON AST.
pub fn extract_json_string_field(body: &[u8], key: &str) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    let needle_dq = format!("\"{key}\"");
    let needle_sq = format!("'{key}'");

    let key_pos = text
        .find(&needle_dq)
        .map(|p| (p, needle_dq.len()))
        .or_else(|| text.find(&needle_sq).map(|p| (p, needle_sq.len())))?;
    let after_key = &text[key_pos.0 + key_pos.1..];
    let colon = after_key.find(':')?;
    let after_colon = after_key[colon + 1..].trim_start();

    let value = if let Some(rest) = after_colon.strip_prefix('"') {
        let end = rest.find('"')?;
        &rest[..end]
    } else if let Some(rest) = after_colon.strip_prefix('\'') {
        let end = rest.find('\'')?;
        &rest[..end]
    } else {
        let end = after_colon
            .find(|c| c == ',' || c == '}' || c == '\n' || c == '\r')
            .unwrap_or(after_colon.len());
        after_colon[..end].trim()
    };

    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
