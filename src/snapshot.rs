//! Snapshot records merged from the two containerd databases.
//!
//! The snapshot graph is described across two files with overlapping
//! fields:
//!
//! - `meta.db` (`v1/<ns>/snapshots/<snapshotter>/<key>`) carries the name,
//!   the parent pointer and labels, partitioned by namespace and
//!   snapshotter.
//! - `metadata.db` (`v1/snapshots/<name>`) carries the numeric filesystem
//!   id (which maps to `snapshots/<id>/fs` under the snapshotter root), the
//!   kind and the size, without namespace partitioning.
//!
//! They are kept as separate read-only views and merged per record rather
//! than denormalized; a key may be present on either side alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot kind as stored in the snapshotter database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotKind {
    #[default]
    Unknown,
    View,
    Active,
    Committed,
}

impl SnapshotKind {
    /// Decode the varint `kind` field.
    pub fn from_u64(v: u64) -> SnapshotKind {
        match v {
            1 => SnapshotKind::View,
            2 => SnapshotKind::Active,
            3 => SnapshotKind::Committed,
            _ => SnapshotKind::Unknown,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Unknown => f.write_str("UNKNOWN"),
            SnapshotKind::View => f.write_str("VIEW"),
            SnapshotKind::Active => f.write_str("ACTIVE"),
            SnapshotKind::Committed => f.write_str("COMMITTED"),
        }
    }
}

/// Combined information about one snapshot key.
///
/// Namespace, snapshotter, key, name, parent and labels come from
/// `meta.db`; id, kind, size and the overlay path come from `metadata.db`.
/// Either side may be missing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotKeyInfo {
    pub namespace: String,
    pub snapshotter: String,
    /// Snapshot key; the root of a chain when referenced by a container.
    pub key: String,
    /// Numeric filesystem id. Zero when metadata.db had no entry.
    pub id: u64,
    pub name: String,
    pub parent: String,
    pub kind: SnapshotKind,
    pub size: u64,
    /// Relative overlay path, `snapshots/<id>/fs`.
    pub overlay_path: String,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The overlay triple resolved for one container, ready to be composed
/// into a mount option string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayPaths {
    /// Colon-separated lower layers, ordered from the layer closest to the
    /// upper down to the base layer. Empty when the chain has no parent.
    pub lowerdir: String,
    /// The container's own writable layer (`snapshots/<id>/fs`).
    pub upperdir: String,
    /// The overlay work directory next to the upper.
    pub workdir: String,
}
