//! Redb table definitions for the persistent key-value store.

use redb::TableDefinition;

// Key -> latest version
pub const LATEST: TableDefinition<&str, u64> = TableDefinition::new("latest");

// "<key>\0<zero-padded version>" -> value bytes
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Separator between a key and its version inside `HISTORY` keys
const VERSION_SEPARATOR: char = '\u{0}';

/// Build the `HISTORY` key for one version of a key.
///
/// Versions are zero-padded so that lexicographic order matches numeric order.
pub fn history_key(key: &str, version: u64) -> String {
    format!("{key}{VERSION_SEPARATOR}{version:020}")
}

/// Smallest `HISTORY` key strictly greater than every version of `key`.
pub fn history_upper_bound(key: &str) -> String {
    format!("{key}\u{1}")
}

/// Version encoded in a `HISTORY` key.
pub fn version_of(history_key: &str) -> Option<u64> {
    history_key
        .rsplit(VERSION_SEPARATOR)
        .next()
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keys_sort_by_version() {
        let mut keys = vec![
            history_key("a", 10),
            history_key("a", 2),
            history_key("a", 1),
        ];
        keys.sort();
        assert_eq!(keys[0], history_key("a", 1));
        assert_eq!(keys[2], history_key("a", 10));
        assert!(history_key("a", u64::MAX) < history_upper_bound("a"));
        assert!(history_upper_bound("a") < history_key("ab", 1));
        assert_eq!(version_of(&history_key("svc/a", 42)), Some(42));
    }
}
