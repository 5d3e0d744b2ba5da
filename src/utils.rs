//! Shared utilities for the connector.

/// Build a namespaced key.
///
/// Format: `{prefix}{key}`, where the prefix carries its own separator (e.g. `session:`).
pub fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// Convert a window in milliseconds to whole seconds, rounding up.
///
/// A zero window is treated as one second so the counter always expires.
pub fn window_secs(window_ms: u64) -> u64 {
    window_ms.div_ceil(1000).max(1)
}

/// Escape glob metacharacters so `prefix` matches literally in a `SCAN MATCH` pattern.
pub fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
