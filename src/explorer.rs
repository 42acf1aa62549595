//! The explorer contract shared by the containerd and Docker backends.
//!
//! The two backends read very different on-disk shapes, but expose one
//! capability set to callers; the CLI renders whatever a
//! [`ContainerExplorer`] returns and never touches the storage formats
//! directly. Each backend owns its resource lifecycle and is released with
//! [`ContainerExplorer::close`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::container::Container;
use crate::drift::Drift;
use crate::error::{ExplorerError, Result};
use crate::export::ExportOptions;
use crate::image::{Content, Image};
use crate::runtime::Task;
use crate::snapshot::SnapshotKeyInfo;

/// Session-scoped cancellation flag.
///
/// Long-running traversals check the token at record boundaries and return
/// [`ExplorerError::Cancelled`] once it is set. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    /// Request cancellation of the session this token is attached to.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Error when the token has been cancelled; used at loop boundaries.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ExplorerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The operations every backend provides.
///
/// Bulk operations (the `list_*` family, `mount_all_containers`,
/// `export_all_containers`, `container_drift` without an id) log per-item
/// failures and continue; single-object operations propagate their errors.
/// Output ordering is deterministic for an unchanged disk.
pub trait ContainerExplorer {
    /// Ordered namespace list from the manifest database.
    fn list_namespaces(&self) -> Result<Vec<String>>;

    /// All containers across all namespaces, lexicographic by id within a
    /// namespace. Runtime state is filled best-effort.
    fn list_containers(&self) -> Result<Vec<Container>>;

    /// All image records across all namespaces.
    fn list_images(&self) -> Result<Vec<Image>>;

    /// All content-blob records across all namespaces.
    fn list_content(&self) -> Result<Vec<Content>>;

    /// Snapshot records merged from the manifest and snapshotter
    /// databases; tolerates either side being absent for a key.
    fn list_snapshots(&self) -> Result<Vec<SnapshotKeyInfo>>;

    /// Reconstructed task state for every container; containers whose
    /// cgroup residue is gone report UNKNOWN.
    fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Detailed information for one container. With `spec_only`, just the
    /// decoded OCI runtime spec.
    fn info_container(&self, container_id: &str, spec_only: bool) -> Result<serde_json::Value>;

    /// Mount one container's overlay read-only at `mountpoint`.
    fn mount_container(&self, container_id: &str, mountpoint: &Path) -> Result<()>;

    /// Mount every selected container under `<mountpoint>/<container id>`.
    fn mount_all_containers(
        &self,
        mountpoint: &Path,
        filter: &BTreeMap<String, String>,
        skip_support_containers: bool,
    ) -> Result<()>;

    /// Filesystem drift for the selected containers, or for one container
    /// when `container_id` is given.
    fn container_drift(
        &self,
        filter: &BTreeMap<String, String>,
        skip_support_containers: bool,
        container_id: Option<&str>,
    ) -> Result<Vec<Drift>>;

    /// Export one container as an archive and/or raw image.
    fn export_container(
        &self,
        container_id: &str,
        output_dir: &Path,
        options: ExportOptions,
    ) -> Result<()>;

    /// Export every selected container, logging per-container failures.
    fn export_all_containers(
        &self,
        output_dir: &Path,
        options: ExportOptions,
        filter: &BTreeMap<String, String>,
        export_support_containers: bool,
    ) -> Result<()>;

    /// The directory containing a snapshotter's data and database, or
    /// `"unknown"` when it cannot be located.
    fn snapshot_root(&self, snapshotter: &str) -> String;

    /// Release the backend's resources.
    fn close(self: Box<Self>);
}
