//! Point-in-time configuration snapshots and the change sets computed between them.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Key/value entries of one namespace, in server-supplied order.
pub type ConfigEntries = IndexMap<String, String>;

/// Provenance of a [`Snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// Fetched from (or confirmed by) a configuration service instance.
    Remote,
    /// Loaded from the on-disk cache.
    LocalFallback,
    /// No configuration is available.
    None,
}

impl SourceType {
    /// Returns a short label for logs and status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Remote => "remote",
            SourceType::LocalFallback => "local-fallback",
            SourceType::None => "none",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Complete, immutable configuration state of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Namespace this snapshot belongs to.
    pub namespace: String,
    /// Opaque version token; `None` when nothing was ever accepted.
    pub release_key: Option<String>,
    /// Configuration entries.
    pub entries: ConfigEntries,
    /// Where the entries came from.
    pub source: SourceType,
}

impl Snapshot {
    /// Empty snapshot with `SourceType::None`.
    pub fn empty(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            release_key: None,
            entries: ConfigEntries::new(),
            source: SourceType::None,
        }
    }

    /// Builds a snapshot from its parts.
    pub fn new(
        namespace: impl Into<String>,
        release_key: impl Into<String>,
        entries: ConfigEntries,
        source: SourceType,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            release_key: Some(release_key.into()),
            entries,
            source,
        }
    }

    /// Looks up a single entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterates over keys in snapshot order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a copy carrying a different provenance.
    pub fn with_source(&self, source: SourceType) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

/// Kind of change applied to a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// Change of one key between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

/// Difference between two successive snapshots of the same namespace.
///
/// Keys appear in the order of the new snapshot, followed by deleted keys in
/// the order of the old snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    namespace: String,
    release_key: Option<String>,
    changes: IndexMap<String, PropertyChange>,
}

impl ChangeSet {
    /// Computes the change set turning `old` into `new`.
    pub fn diff(old: &Snapshot, new: &Snapshot) -> Self {
        let mut changes = IndexMap::new();

        for (key, new_value) in &new.entries {
            match old.entries.get(key) {
                None => {
                    changes.insert(
                        key.clone(),
                        PropertyChange {
                            key: key.clone(),
                            old_value: None,
                            new_value: Some(new_value.clone()),
                            change_type: ChangeType::Added,
                        },
                    );
                }
                Some(old_value) if old_value != new_value => {
                    changes.insert(
                        key.clone(),
                        PropertyChange {
                            key: key.clone(),
                            old_value: Some(old_value.clone()),
                            new_value: Some(new_value.clone()),
                            change_type: ChangeType::Modified,
                        },
                    );
                }
                Some(_) => {}
            }
        }

        for (key, old_value) in &old.entries {
            if !new.entries.contains_key(key) {
                changes.insert(
                    key.clone(),
                    PropertyChange {
                        key: key.clone(),
                        old_value: Some(old_value.clone()),
                        new_value: None,
                        change_type: ChangeType::Deleted,
                    },
                );
            }
        }

        Self {
            namespace: new.namespace.clone(),
            release_key: new.release_key.clone(),
            changes,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Release key of the snapshot this change set leads to.
    pub fn release_key(&self) -> Option<&str> {
        self.release_key.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn changed_keys(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn is_changed(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&PropertyChange> {
        self.changes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyChange> {
        self.changes.values()
    }
}
