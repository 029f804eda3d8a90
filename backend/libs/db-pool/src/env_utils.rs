//! Environment variable parsing helpers shared by the pool and service configs.
//!
//! Missing or unparsable values fall back to the supplied default.

use std::str::FromStr;
use std::time::Duration;

/// Parse an environment variable with a default fallback
///
/// ```ignore
/// let max: u32 = parse_env_with_default("DB_MAX_CONNECTIONS", 10);
/// ```
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    parse_env_optional(key).unwrap_or(default)
}

/// `None` when the variable is missing or does not parse
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Comma separated list, blank entries dropped. `None` when the variable is unset.
pub fn parse_env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Whole seconds
pub fn parse_env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env_with_default(key, default.as_secs()))
}

/// Whole milliseconds
pub fn parse_env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_env_with_default(key, default.as_millis() as u64))
}
