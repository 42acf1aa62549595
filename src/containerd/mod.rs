//! Explorer backend for containerd-managed containers.
//!
//! All listing operations read the manifest database (`meta.db`); mount and
//! drift additionally resolve layer ids through the snapshotter database
//! (`metadata.db`), which is opened lazily per operation so a missing file
//! only degrades the operations that need it.

pub mod snapshots;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::container::Container;
use crate::drift::{self, Drift, DriftOptions};
use crate::error::{ExplorerError, Result};
use crate::exec::{CommandExecutor, SystemExecutor};
use crate::explorer::{CancellationToken, ContainerExplorer};
use crate::export::{self, ExportOptions, TempMount};
use crate::image::{Content, Image};
use crate::kvdb::{Entry, KvDb};
use crate::mount;
use crate::runtime::{self, Task};
use crate::schema;
use crate::snapshot::{OverlayPaths, SnapshotKeyInfo};
use crate::support::{self, SupportContainerPolicy};

use self::snapshots::SnapshotStore;

/// Default location of the manifest database under the containerd root.
pub const DEFAULT_METADATA_PATH: &str = "io.containerd.metadata.v1.bolt/meta.db";

/// Default location of the snapshotter database under the containerd root.
pub const DEFAULT_SNAPSHOT_PATH: &str = "io.containerd.snapshotter.v1.overlayfs/metadata.db";

/// Configuration for opening a containerd explorer.
#[derive(Debug, Default)]
pub struct ContainerdOptions {
    /// Mount point of the captured disk image; empty when runtime-state
    /// reconstruction is not wanted.
    pub image_root: PathBuf,
    /// The containerd root directory (usually `<image>/var/lib/containerd`).
    pub containerd_root: PathBuf,
    /// Manifest database override; defaults under the containerd root.
    pub metadata_file: Option<PathBuf>,
    /// Snapshotter database override; defaults under the containerd root.
    pub snapshot_metadata_file: Option<PathBuf>,
    /// Support-container policy; `None` classifies nothing.
    pub policy: Option<SupportContainerPolicy>,
    /// Name of a cached-layer directory under the snapshot root.
    pub layer_cache: Option<String>,
}

/// Explorer over a containerd installation on a dead disk.
pub struct ContainerdExplorer {
    image_root: PathBuf,
    root: PathBuf,
    snapshot_db_path: PathBuf,
    meta: KvDb,
    policy: Option<SupportContainerPolicy>,
    layer_cache: Option<String>,
    exec: Box<dyn CommandExecutor>,
    cancel: CancellationToken,
}

impl ContainerdExplorer {
    /// Open the manifest database and build an explorer.
    pub fn open(options: ContainerdOptions) -> Result<ContainerdExplorer> {
        let meta_path = options
            .metadata_file
            .unwrap_or_else(|| options.containerd_root.join(DEFAULT_METADATA_PATH));
        let snapshot_db_path = options
            .snapshot_metadata_file
            .unwrap_or_else(|| options.containerd_root.join(DEFAULT_SNAPSHOT_PATH));

        let meta = KvDb::open(&meta_path)?;
        tracing::debug!(
            meta = %meta_path.display(),
            snapshot = %snapshot_db_path.display(),
            "opened containerd explorer"
        );

        Ok(ContainerdExplorer {
            image_root: options.image_root,
            root: options.containerd_root,
            snapshot_db_path,
            meta,
            policy: options.policy,
            layer_cache: options.layer_cache,
            exec: Box::new(SystemExecutor),
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the command executor (tests, dry runs).
    pub fn with_executor(mut self, exec: Box<dyn CommandExecutor>) -> Self {
        self.exec = exec;
        self
    }

    /// Attach a session cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Open the snapshotter database, or `None` (logged) when it is
    /// missing; listing operations tolerate the absence.
    fn try_snapshot_db(&self) -> Option<KvDb> {
        match KvDb::open(&self.snapshot_db_path) {
            Ok(db) => Some(db),
            Err(e) => {
                tracing::warn!(
                    path = %self.snapshot_db_path.display(),
                    error = %e,
                    "snapshotter database unavailable"
                );
                None
            }
        }
    }

    /// Open the snapshotter database for operations that cannot proceed
    /// without it.
    fn require_snapshot_db(&self) -> Result<KvDb> {
        KvDb::open(&self.snapshot_db_path).map_err(|e| {
            tracing::error!(
                path = %self.snapshot_db_path.display(),
                error = %e,
                "snapshotter database required"
            );
            ExplorerError::NoSnapshotDatabase
        })
    }

    /// Decode the containers of one namespace, without runtime state.
    fn namespace_containers(&self, namespace: &str) -> Result<Vec<Container>> {
        self.meta.view(|tx| {
            let mut containers = Vec::new();
            let Some(bucket) = schema::containers_bucket(tx, namespace) else {
                return Ok(containers); // empty namespace
            };
            for entry in bucket.iter() {
                let Entry::Nested(id, node) = entry else {
                    continue;
                };
                let id = String::from_utf8_lossy(id).into_owned();
                let mut container = Container::from_bucket(namespace, &id, &node);
                container.support_container =
                    support::is_support_container(self.policy.as_ref(), &container);
                containers.push(container);
            }
            Ok(containers)
        })
    }

    /// Best-effort runtime state for one container.
    fn fill_runtime_state(&self, container: &mut Container) {
        if self.image_root.as_os_str().is_empty() {
            return;
        }
        let cgroups_path = container.cgroups_path();
        let task = runtime::reconstruct_task(
            &self.image_root,
            &container.namespace,
            &container.id,
            cgroups_path.as_deref(),
        );
        container.process_id = task.pid;
        container.status = task.status;
        container.container_type = task.container_type;
    }

    /// Find a container by id, searching every namespace.
    fn find_container(&self, container_id: &str) -> Result<Container> {
        for ns in self.list_namespaces()? {
            self.cancel.check()?;
            if let Some(c) = self
                .namespace_containers(&ns)?
                .into_iter()
                .find(|c| c.id == container_id)
            {
                return Ok(c);
            }
        }
        Err(ExplorerError::NotFound(container_id.to_string()))
    }

    /// Resolve the overlay triple for a container.
    fn overlay_paths(&self, container: &Container) -> Result<OverlayPaths> {
        let sdb = self.require_snapshot_db()?;
        let store = SnapshotStore::new(
            &self.root,
            &self.meta,
            Some(&sdb),
            self.layer_cache.as_deref(),
        );
        store.overlay_paths(
            &container.namespace,
            &container.snapshotter,
            &container.snapshot_key,
        )
    }

    /// Containers selected by the label filter and support policy.
    fn selected_containers(
        &self,
        filter: &BTreeMap<String, String>,
        skip_support: bool,
    ) -> Result<Vec<Container>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .filter(|c| {
                if skip_support && c.support_container {
                    tracing::info!(
                        namespace = %c.namespace,
                        container = %c.id,
                        "skipping support container"
                    );
                    return false;
                }
                mount::matches_label_filter(c, filter)
            })
            .collect())
    }
}

impl ContainerExplorer for ContainerdExplorer {
    fn list_namespaces(&self) -> Result<Vec<String>> {
        self.meta.view(|tx| Ok(schema::namespaces(tx)))
    }

    fn list_containers(&self) -> Result<Vec<Container>> {
        let mut containers = Vec::new();
        for ns in self.list_namespaces()? {
            self.cancel.check()?;
            let mut in_ns = self.namespace_containers(&ns)?;
            for container in &mut in_ns {
                self.fill_runtime_state(container);
            }
            containers.append(&mut in_ns);
        }
        Ok(containers)
    }

    fn list_images(&self) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for ns in self.list_namespaces()? {
            self.cancel.check()?;
            self.meta.view(|tx| {
                let Some(bucket) = schema::images_bucket(tx, &ns) else {
                    return Ok(());
                };
                for entry in bucket.iter() {
                    let Entry::Nested(name, node) = entry else {
                        continue;
                    };
                    let name = String::from_utf8_lossy(name).into_owned();
                    let mut image = Image::from_bucket(&ns, &name, &node);
                    image.support_container_image = support::is_support_image(
                        self.policy.as_ref(),
                        &crate::container::image_basename(&image.name),
                    );
                    images.push(image);
                }
                Ok(())
            })?;
        }
        Ok(images)
    }

    fn list_content(&self) -> Result<Vec<Content>> {
        let mut content = Vec::new();
        for ns in self.list_namespaces()? {
            self.cancel.check()?;
            self.meta.view(|tx| {
                let Some(bucket) = schema::blobs_bucket(tx, &ns) else {
                    return Ok(());
                };
                for entry in bucket.iter() {
                    let Entry::Nested(digest, node) = entry else {
                        continue;
                    };
                    let digest = String::from_utf8_lossy(digest).into_owned();
                    content.push(Content::from_bucket(&ns, &digest, &node));
                }
                Ok(())
            })?;
        }
        Ok(content)
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotKeyInfo>> {
        let sdb = self.try_snapshot_db();
        let store = SnapshotStore::new(
            &self.root,
            &self.meta,
            sdb.as_ref(),
            self.layer_cache.as_deref(),
        );

        let mut snapshots = Vec::new();
        for ns in self.list_namespaces()? {
            self.cancel.check()?;
            snapshots.append(&mut store.list(&ns)?);
        }
        Ok(snapshots)
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        if self.image_root.as_os_str().is_empty() {
            tracing::error!("image root is empty; unable to reconstruct tasks");
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        for container in self.list_containers()? {
            self.cancel.check()?;
            tasks.push(Task {
                namespace: container.namespace.clone(),
                name: container.id.clone(),
                pid: container.process_id,
                container_type: container.container_type,
                status: container.status,
            });
        }
        Ok(tasks)
    }

    fn info_container(&self, container_id: &str, spec_only: bool) -> Result<serde_json::Value> {
        let container = self.find_container(container_id)?;

        let spec_json = container
            .spec
            .as_ref()
            .and_then(|blob| blob.to_json())
            .unwrap_or(serde_json::Value::Null);

        if spec_only {
            return Ok(spec_json);
        }

        let mut value = serde_json::to_value(&container)?;
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("Spec".to_string(), spec_json);
        }
        Ok(value)
    }

    fn mount_container(&self, container_id: &str, mountpoint: &Path) -> Result<()> {
        let container = self.find_container(container_id)?;
        tracing::debug!(
            snapshotter = %container.snapshotter,
            snapshot_key = %container.snapshot_key,
            image = %container.image,
            "mounting container"
        );

        let paths = self.overlay_paths(&container)?;
        tracing::debug!(
            lowerdir = %paths.lowerdir,
            upperdir = %paths.upperdir,
            workdir = %paths.workdir,
            "overlay directories"
        );

        if paths.lowerdir.is_empty() {
            return Err(ExplorerError::LowerdirEmpty(container_id.to_string()));
        }
        mount::mount_overlay(self.exec.as_ref(), &paths, mountpoint)
    }

    fn mount_all_containers(
        &self,
        mountpoint: &Path,
        filter: &BTreeMap<String, String>,
        skip_support_containers: bool,
    ) -> Result<()> {
        for container in self.selected_containers(filter, skip_support_containers)? {
            self.cancel.check()?;

            let ctr_mountpoint = mountpoint.join(&container.id);
            if let Err(e) = std::fs::create_dir_all(&ctr_mountpoint) {
                tracing::error!(
                    container = %container.id,
                    mountpoint = %ctr_mountpoint.display(),
                    error = %e,
                    "creating container mountpoint; skipping mount"
                );
                continue;
            }

            if let Err(e) = self.mount_container(&container.id, &ctr_mountpoint) {
                tracing::error!(container = %container.id, error = %e, "mounting container");
            }
        }
        Ok(())
    }

    fn container_drift(
        &self,
        filter: &BTreeMap<String, String>,
        skip_support_containers: bool,
        container_id: Option<&str>,
    ) -> Result<Vec<Drift>> {
        let sdb = self.require_snapshot_db()?;
        let store = SnapshotStore::new(
            &self.root,
            &self.meta,
            Some(&sdb),
            self.layer_cache.as_deref(),
        );

        let containers = match container_id {
            Some(id) => vec![self.find_container(id)?],
            None => self.selected_containers(filter, skip_support_containers)?,
        };

        let mut drifts = Vec::new();
        for container in containers {
            self.cancel.check()?;
            let paths = match store.overlay_paths(
                &container.namespace,
                &container.snapshotter,
                &container.snapshot_key,
            ) {
                Ok(p) => p,
                Err(e) if container_id.is_some() => return Err(e),
                Err(e) => {
                    tracing::error!(container = %container.id, error = %e, "resolving upperdir");
                    continue;
                }
            };

            match drift::diff_directory(
                &container.id,
                Path::new(&paths.upperdir),
                &DriftOptions::default(),
            ) {
                Ok(d) => drifts.push(d),
                Err(e) if container_id.is_some() => return Err(e),
                Err(e) => {
                    tracing::error!(container = %container.id, error = %e, "walking upperdir");
                }
            }
        }
        Ok(drifts)
    }

    fn export_container(
        &self,
        container_id: &str,
        output_dir: &Path,
        options: ExportOptions,
    ) -> Result<()> {
        let container = self.find_container(container_id)?;
        std::fs::create_dir_all(output_dir).map_err(|e| ExplorerError::io(output_dir, e))?;

        let mut temp_mount = TempMount::create(self.exec.as_ref())?;
        self.mount_container(&container.id, temp_mount.path())?;
        temp_mount.mark_mounted();

        export::export_mounted(
            self.exec.as_ref(),
            &container.id,
            temp_mount.path(),
            output_dir,
            options,
        )
    }

    fn export_all_containers(
        &self,
        output_dir: &Path,
        options: ExportOptions,
        filter: &BTreeMap<String, String>,
        export_support_containers: bool,
    ) -> Result<()> {
        for container in self.selected_containers(filter, !export_support_containers)? {
            self.cancel.check()?;
            if let Err(e) = self.export_container(&container.id, output_dir, options) {
                tracing::error!(container = %container.id, error = %e, "exporting container");
            }
        }
        Ok(())
    }

    fn snapshot_root(&self, snapshotter: &str) -> String {
        match snapshots::snapshot_root_dir(&self.root, snapshotter) {
            Some(dir) => dir.display().to_string(),
            None => "unknown".to_string(),
        }
    }

    fn close(self: Box<Self>) {
        self.meta.close();
    }
}
