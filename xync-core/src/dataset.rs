//! Dataset and snapshot naming.
//!
//! A dataset name is a non-empty, slash-separated path whose leading
//! component is the pool. Snapshots are identified as `dataset@name`.

use serde::{Deserialize, Serialize};

/// A ZFS dataset name such as `pool/a/b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset(pub String);

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pool is the leading path component.
    pub fn pool(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// A dataset equal to its own pool, e.g. `tank`.
    pub fn is_root(&self) -> bool {
        !self.0.contains('/')
    }

    /// Everything up to the last `/`, or `None` for a root dataset.
    pub fn parent(&self) -> Option<Dataset> {
        self.0.rsplit_once('/').map(|(head, _)| Dataset::new(head))
    }

    /// The destination for a replicated source: the full source path is
    /// appended under `self`, so `p2`.join_source(`p1/a`) is `p2/p1/a`.
    pub fn join_source(&self, source: &Dataset) -> Dataset {
        Dataset::new(format!("{}/{}", self.0, source.0))
    }

    /// Full snapshot identifier `dataset@name`.
    pub fn snapshot(&self, name: &str) -> String {
        format!("{}@{}", self.0, name)
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a snapshot inventory: the full `dataset@name` identifier
/// and its creation time in epoch seconds. Inventories are kept sorted
/// ascending by creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created: i64,
}

impl SnapshotInfo {
    /// The part after `@`, shared between source and destination copies
    /// of the same snapshot.
    pub fn short_name(&self) -> &str {
        self.name.rsplit_once('@').map(|(_, n)| n).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_leading_component() {
        assert_eq!(Dataset::new("tank/a/b").pool(), "tank");
        assert_eq!(Dataset::new("tank").pool(), "tank");
    }

    #[test]
    fn root_dataset_has_no_slash() {
        assert!(Dataset::new("tank").is_root());
        assert!(!Dataset::new("tank/a").is_root());
    }

    #[test]
    fn parent_strips_last_component() {
        assert_eq!(
            Dataset::new("tank/a/b").parent(),
            Some(Dataset::new("tank/a"))
        );
        assert_eq!(Dataset::new("tank").parent(), None);
    }

    #[test]
    fn join_source_appends_full_source_path() {
        let dst = Dataset::new("p2");
        let src = Dataset::new("p1/a");
        assert_eq!(dst.join_source(&src).as_str(), "p2/p1/a");
    }

    #[test]
    fn snapshot_short_name() {
        let snap = SnapshotInfo {
            name: "tank/a@autorep-x".to_string(),
            created: 10,
        };
        assert_eq!(snap.short_name(), "autorep-x");
    }
}
