//! Snapshot store: chain resolution and overlay-path computation.
//!
//! Snapshot information is split across the two containerd databases. The
//! manifest database (`meta.db`) names each snapshot, points at its parent
//! and carries labels; the snapshotter database (`metadata.db`) assigns the
//! numeric id that locates the layer on disk:
//!
//! ```text
//! <snapshot root>/snapshots/<id>/fs     layer content
//! <snapshot root>/snapshots/<id>/work   overlay workdir
//! ```
//!
//! Resolving a container walks the parent chain in `meta.db` from the
//! container's snapshot key to the base layer, then maps every chain
//! element to its id in `metadata.db`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{ExplorerError, Result};
use crate::kvdb::{Bucket, Entry, KvDb};
use crate::schema;
use crate::snapshot::{OverlayPaths, SnapshotKeyInfo, SnapshotKind};

/// Combined read access to the snapshot views of both databases.
pub struct SnapshotStore<'a> {
    /// Containerd root directory (holds the per-snapshotter subtrees).
    root: &'a Path,
    meta: &'a KvDb,
    snapshot_db: Option<&'a KvDb>,
    /// Directory name under the snapshot root holding cached layer
    /// symlinks, used in place of `snapshots/<id>/fs` when present.
    layer_cache: Option<&'a str>,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(
        root: &'a Path,
        meta: &'a KvDb,
        snapshot_db: Option<&'a KvDb>,
        layer_cache: Option<&'a str>,
    ) -> SnapshotStore<'a> {
        SnapshotStore {
            root,
            meta,
            snapshot_db,
            layer_cache,
        }
    }

    /// All snapshot records of one namespace, each merged with the
    /// snapshotter database's view when an entry exists there.
    pub fn list(&self, namespace: &str) -> Result<Vec<SnapshotKeyInfo>> {
        let mut infos = self.meta.view(|tx| {
            let mut infos = Vec::new();
            let Some(snapshotters) = schema::snapshotters_bucket(tx, namespace) else {
                return Ok(infos); // empty store
            };

            for entry in snapshotters.iter() {
                let Entry::Nested(snapshotter, keys) = entry else {
                    continue;
                };
                let snapshotter = String::from_utf8_lossy(snapshotter).into_owned();

                for key_entry in keys.iter() {
                    let Entry::Nested(key, node) = key_entry else {
                        continue;
                    };
                    let mut info = SnapshotKeyInfo {
                        namespace: namespace.to_string(),
                        snapshotter: snapshotter.clone(),
                        key: String::from_utf8_lossy(key).into_owned(),
                        ..Default::default()
                    };
                    read_meta_node(&mut info, &node);
                    infos.push(info);
                }
            }
            Ok(infos)
        })?;

        if let Some(sdb) = self.snapshot_db {
            sdb.view(|tx| {
                for info in &mut infos {
                    match schema::snapshotter_snapshot_bucket(tx, &info.name) {
                        Some(node) => merge_snapshotter_node(info, &node),
                        None => {
                            tracing::debug!(
                                key = %info.key,
                                name = %info.name,
                                "snapshot has no entry in the snapshotter database"
                            );
                        }
                    }
                }
                Ok(())
            })?;
        } else {
            tracing::warn!("snapshotter database unavailable; snapshot ids and kinds omitted");
        }

        Ok(infos)
    }

    /// Resolve the snapshot-name chain for a container, from its own
    /// active snapshot down to the base layer.
    ///
    /// The walk is iterative with a visited set: an untrusted disk may
    /// present arbitrarily long or looping parent chains.
    pub fn snapshot_keys(
        &self,
        namespace: &str,
        snapshotter: &str,
        snapshot_key: &str,
    ) -> Result<Vec<String>> {
        self.meta.view(|tx| {
            let mut chain = Vec::new();
            let mut seen: HashSet<String> = HashSet::new();
            let mut key = snapshot_key.to_string();

            loop {
                let node = schema::snapshot_key_bucket(tx, namespace, snapshotter, &key)
                    .ok_or_else(|| ExplorerError::ChainDangling(key.clone()))?;
                if !seen.insert(key.clone()) {
                    return Err(ExplorerError::ChainCycle(key));
                }

                let name = node.get_str(schema::KEY_NAME).unwrap_or_default();
                let parent = node.get_str(schema::KEY_PARENT).unwrap_or_default();
                chain.push(name);

                if parent.is_empty() {
                    break;
                }
                key = parent;
            }
            Ok(chain)
        })
    }

    /// Compute the overlay triple for a container's snapshot chain.
    ///
    /// The lower list is ordered from the layer closest to the upper down
    /// to the base layer and is emitted verbatim into the mount options;
    /// nothing is reordered or deduplicated.
    pub fn overlay_paths(
        &self,
        namespace: &str,
        snapshotter: &str,
        snapshot_key: &str,
    ) -> Result<OverlayPaths> {
        let sdb = self.snapshot_db.ok_or(ExplorerError::NoSnapshotDatabase)?;
        let chain = self.snapshot_keys(namespace, snapshotter, snapshot_key)?;
        let snapshot_root = snapshot_root_dir(self.root, snapshotter).ok_or_else(|| {
            ExplorerError::SchemaAbsent(format!("snapshot root for snapshotter {snapshotter:?}"))
        })?;

        sdb.view(|tx| {
            let upper_id = snapshot_id(tx, &chain[0])?;
            let upper_base = snapshot_root.join("snapshots").join(upper_id.to_string());

            let mut lowerdir = String::new();
            for name in &chain[1..] {
                let id = snapshot_id(tx, name)?;
                let dir = self.lower_layer_dir(&snapshot_root, id);
                if !lowerdir.is_empty() {
                    lowerdir.push(':');
                }
                lowerdir.push_str(&dir.display().to_string());
            }

            Ok(OverlayPaths {
                lowerdir,
                upperdir: upper_base.join("fs").display().to_string(),
                workdir: upper_base.join("work").display().to_string(),
            })
        })
    }

    /// The directory holding one lower layer, preferring the layer cache
    /// when it is enabled and has an entry for this id.
    fn lower_layer_dir(&self, snapshot_root: &Path, id: u64) -> PathBuf {
        if let Some(cache) = self.layer_cache {
            let cached = snapshot_root.join(cache).join(id.to_string());
            if cached.exists() {
                return cached;
            }
        }
        snapshot_root.join("snapshots").join(id.to_string()).join("fs")
    }
}

/// Read the manifest-database fields of a snapshot node.
fn read_meta_node(info: &mut SnapshotKeyInfo, node: &Bucket<'_>) {
    let (created, updated) = schema::read_timestamps(node);
    info.created_at = created;
    info.updated_at = updated;
    info.name = node.get_str(schema::KEY_NAME).unwrap_or_default();
    info.parent = node.get_str(schema::KEY_PARENT).unwrap_or_default();
    info.labels = schema::read_labels(node);
}

/// Merge the snapshotter-database fields into a record that already holds
/// the manifest view. The manifest wins for name and labels unless empty;
/// parents must agree, and a disagreement keeps the manifest value.
fn merge_snapshotter_node(info: &mut SnapshotKeyInfo, node: &Bucket<'_>) {
    let (created, updated) = schema::read_timestamps(node);
    if info.created_at.is_none() {
        info.created_at = created;
    }
    if info.updated_at.is_none() {
        info.updated_at = updated;
    }

    let parent = node.get_str(schema::KEY_PARENT).unwrap_or_default();
    if info.parent.is_empty() {
        info.parent = parent;
    } else if info.parent != parent {
        tracing::info!(
            manifest_parent = %info.parent,
            snapshotter_parent = %parent,
            "snapshot parent disagrees between databases; keeping manifest value"
        );
    }

    info.id = schema::read_varint(node, schema::KEY_ID);
    info.overlay_path = format!("snapshots/{}/fs", info.id);
    info.kind = SnapshotKind::from_u64(schema::read_varint(node, schema::KEY_KIND));
    info.size = schema::read_varint(node, schema::KEY_SIZE);

    for (k, v) in schema::read_labels(node) {
        match info.labels.get(&k) {
            Some(existing) if existing != &v => {
                tracing::warn!(
                    label = %k,
                    existing = %existing,
                    new = %v,
                    "snapshot label disagrees between databases; keeping manifest value"
                );
            }
            Some(_) => {}
            None => {
                info.labels.insert(k, v);
            }
        }
    }
}

/// Look up a snapshot's numeric id in the snapshotter database.
fn snapshot_id(tx: &crate::kvdb::Tx<'_>, name: &str) -> Result<u64> {
    let node = schema::snapshotter_snapshot_bucket(tx, name)
        .ok_or_else(|| ExplorerError::ChainDangling(name.to_string()))?;
    Ok(schema::read_varint(&node, schema::KEY_ID))
}

/// Locate a snapshotter's root: the first child of the containerd root
/// whose name contains the snapshotter name, case-insensitively. For the
/// default overlayfs snapshotter this is
/// `<containerd root>/io.containerd.snapshotter.v1.overlayfs`.
pub fn snapshot_root_dir(root: &Path, snapshotter: &str) -> Option<PathBuf> {
    let needle = snapshotter.to_lowercase();
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}
