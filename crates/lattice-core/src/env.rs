//! Environment variable utilities
//!
//! Typed lookups with defaults, used by the logging setup and the pool
//! configuration. Parse failures fall back to the default silently; these
//! are diagnostics knobs, not configuration surface.

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default`
#[inline]
pub fn get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable as `T` if it is set and valid
#[inline]
pub fn get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Truthy environment variable: "1", "true", "yes", "on" (case-insensitive)
#[inline]
pub fn get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Whether the variable is set at all, regardless of value
#[inline]
pub fn is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
