//! Key naming scheme: every key is namespaced by identity and carries a
//! kind segment that drives quota cleanup.
//!
//! Layout: `{identity}:progress`, `{identity}:scratch:{name}`,
//! `{identity}:cache:{name}`, `{identity}:meta:{name}`.

/// Classification of a stored key for eviction purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The progress document itself; truncated, never deleted.
    Document,
    /// In-progress exam snapshots and similar scratch state; deleted first
    /// under quota pressure.
    Scratch,
    /// Derived result caches; deleted with scratch keys.
    Cache,
    /// Flags and markers (migration guards); never evicted.
    Meta,
    /// Anything that does not follow the naming scheme.
    Unknown,
}

/// Builder for namespaced storage keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey;

impl StorageKey {
    /// Key holding the progress document for `identity`.
    #[must_use]
    pub fn progress(identity: &str) -> String {
        format!("{identity}:progress")
    }

    /// Scratch key (in-progress exam snapshot, temporary result).
    #[must_use]
    pub fn scratch(identity: &str, name: &str) -> String {
        format!("{identity}:scratch:{name}")
    }

    /// Cache key for derived data.
    #[must_use]
    pub fn cache(identity: &str, name: &str) -> String {
        format!("{identity}:cache:{name}")
    }

    /// Meta key for flags such as migration guards.
    #[must_use]
    pub fn meta(identity: &str, name: &str) -> String {
        format!("{identity}:meta:{name}")
    }

    /// Classify an arbitrary stored key.
    #[must_use]
    pub fn classify(key: &str) -> KeyKind {
        let mut segments = key.splitn(3, ':');
        let _identity = segments.next();
        match segments.next() {
            Some("progress") => KeyKind::Document,
            Some("scratch") => KeyKind::Scratch,
            Some("cache") => KeyKind::Cache,
            Some("meta") => KeyKind::Meta,
            _ => KeyKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_follows_naming_scheme() {
        assert_eq!(StorageKey::classify("u1:progress"), KeyKind::Document);
        assert_eq!(
            StorageKey::classify(&StorageKey::scratch("u1", "exam-2")),
            KeyKind::Scratch
        );
        assert_eq!(
            StorageKey::classify(&StorageKey::cache("u1", "review-queue")),
            KeyKind::Cache
        );
        assert_eq!(
            StorageKey::classify(&StorageKey::meta("u1", "full-reset-applied")),
            KeyKind::Meta
        );
        assert_eq!(StorageKey::classify("loose-key"), KeyKind::Unknown);
    }
}
