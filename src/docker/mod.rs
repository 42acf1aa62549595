//! Explorer backend for Docker-managed containers.
//!
//! Docker's metadata lives in plain files under the docker root rather
//! than an embedded database:
//!
//! ```text
//! containers/<id>/config.v2.json                  container record
//! image/<driver>/repositories.json                image name -> digest map
//! image/<driver>/layerdb/mounts/<id>/mount-id     overlay mount indirection
//! <driver>/<mount-id>/{diff,lower,work}           overlay directories
//! ```
//!
//! When a containerd root coexists on the image (Docker on top of
//! containerd), namespaces are read from `meta.db`; otherwise the backend
//! reports the single `default` namespace.

pub mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::container::{image_basename, Container, ContainerType};
use crate::drift::{self, Drift, DriftOptions};
use crate::error::{ExplorerError, Result};
use crate::exec::{CommandExecutor, SystemExecutor};
use crate::explorer::{CancellationToken, ContainerExplorer};
use crate::export::{self, ExportOptions, TempMount};
use crate::image::{Content, Image};
use crate::kvdb::KvDb;
use crate::mount;
use crate::runtime::Task;
use crate::schema;
use crate::snapshot::{OverlayPaths, SnapshotKeyInfo};
use crate::support::{self, SupportContainerPolicy};

use self::config::ConfigFile;

const CONFIG_V2: &str = "config.v2.json";
const CONTAINERS_DIR: &str = "containers";
const IMAGE_DIR: &str = "image";
const REPOSITORIES_FILE: &str = "repositories.json";
const OVERLAY2: &str = "overlay2";

/// Configuration for opening a Docker explorer.
#[derive(Debug, Default)]
pub struct DockerOptions {
    /// Mount point of the captured disk image (informational here).
    pub image_root: PathBuf,
    /// The docker root directory (usually `<image>/var/lib/docker`).
    pub docker_root: PathBuf,
    /// Optional containerd root on the same image; its manifest database
    /// provides namespace names.
    pub containerd_root: Option<PathBuf>,
    /// Manifest database override.
    pub metadata_file: Option<PathBuf>,
    /// Support-container policy; `None` classifies nothing.
    pub policy: Option<SupportContainerPolicy>,
}

/// Explorer over a Docker installation on a dead disk.
pub struct DockerExplorer {
    root: PathBuf,
    meta: Option<KvDb>,
    policy: Option<SupportContainerPolicy>,
    exec: Box<dyn CommandExecutor>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DockerExplorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerExplorer")
            .field("root", &self.root)
            .field("meta", &self.meta)
            .field("policy", &self.policy)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl DockerExplorer {
    /// Build an explorer over a docker root directory.
    pub fn open(options: DockerOptions) -> Result<DockerExplorer> {
        if !options.docker_root.is_dir() {
            return Err(ExplorerError::InputMissing(options.docker_root));
        }

        // Docker on containerd: the manifest database names the
        // namespaces. Absence is fine; anything else is logged.
        let meta = options
            .containerd_root
            .as_ref()
            .filter(|root| root.is_dir())
            .and_then(|root| {
                let path = options
                    .metadata_file
                    .clone()
                    .unwrap_or_else(|| root.join(crate::containerd::DEFAULT_METADATA_PATH));
                match KvDb::open(&path) {
                    Ok(db) => Some(db),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "manifest database unavailable");
                        None
                    }
                }
            });

        tracing::debug!(
            root = %options.docker_root.display(),
            with_manifest_db = meta.is_some(),
            "opened docker explorer"
        );

        Ok(DockerExplorer {
            root: options.docker_root,
            meta,
            policy: options.policy,
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

    /// Sorted container ids: every directory under `containers/`.
    fn container_ids(&self) -> Result<Vec<String>> {
        let dir = self.root.join(CONTAINERS_DIR);
        let entries = std::fs::read_dir(&dir).map_err(|e| ExplorerError::io(&dir, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ExplorerError::io(&dir, e))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Parse a container's `config.v2.json`.
    fn container_config(&self, container_id: &str) -> Result<ConfigFile> {
        let path = self
            .root
            .join(CONTAINERS_DIR)
            .join(container_id)
            .join(CONFIG_V2);
        let data = std::fs::read(&path).map_err(|e| ExplorerError::io(&path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Map image digests to friendly `name:tag` references.
    ///
    /// `repositories.json` can carry both `name:tag` and `name@digest`
    /// entries for one digest; the tag form wins.
    fn repositories(&self) -> BTreeMap<String, String> {
        let mut repos = BTreeMap::new();

        let image_dir = self.root.join(IMAGE_DIR);
        let Ok(storage_dirs) = std::fs::read_dir(&image_dir) else {
            return repos;
        };
        let mut storage_dirs: Vec<PathBuf> =
            storage_dirs.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        storage_dirs.sort();

        for storage_dir in storage_dirs {
            let file = storage_dir.join(REPOSITORIES_FILE);
            let Ok(data) = std::fs::read(&file) else {
                continue;
            };
            let Ok(doc) = serde_json::from_slice::<RepositoriesFile>(&data) else {
                tracing::warn!(path = %file.display(), "unparsable repositories file");
                continue;
            };

            for names in doc.repositories.values() {
                for (name, digest) in names {
                    if name.contains('@') {
                        // Digest-pinned alias; only used when no tag names
                        // the digest.
                        repos.entry(digest.clone()).or_insert_with(|| name.clone());
                    } else {
                        repos.insert(digest.clone(), name.clone());
                    }
                }
            }
        }
        repos
    }

    /// Build the explorer's container record for one id.
    fn ce_container(
        &self,
        container_id: &str,
        repositories: &BTreeMap<String, String>,
    ) -> Result<Container> {
        let cfg = self.container_config(container_id)?;

        // Prefer the repository map's friendly name over the raw digest.
        let image = repositories
            .get(&cfg.image)
            .cloned()
            .unwrap_or_else(|| cfg.image.clone());

        let mut exposed_ports: Vec<String> =
            cfg.config.exposed_ports.keys().cloned().collect();
        exposed_ports.sort();

        let mut container = Container {
            namespace: "default".to_string(),
            id: cfg.id.clone(),
            image_base: image_basename(&image),
            image,
            hostname: cfg.config.hostname.clone(),
            snapshotter: cfg.driver.clone(),
            snapshot_key: String::new(),
            runtime: Some(cfg.name.clone()),
            created_at: cfg.created,
            updated_at: None,
            labels: cfg.config.labels.clone(),
            spec: None,
            support_container: false,
            container_type: ContainerType::Docker,
            process_id: (cfg.state.pid != 0).then_some(cfg.state.pid),
            status: cfg.state.status(),
            running: cfg.state.running,
            exposed_ports,
        };
        container.support_container =
            support::is_support_container(self.policy.as_ref(), &container);
        Ok(container)
    }

    /// Resolve a container's overlay triple via the layerdb mount-id
    /// indirection.
    fn overlay_paths(&self, container_id: &str) -> Result<OverlayPaths> {
        let cfg = self.container_config(container_id)?;
        let driver = if cfg.driver.is_empty() {
            OVERLAY2.to_string()
        } else {
            cfg.driver
        };

        let mount_id_path = self
            .root
            .join(IMAGE_DIR)
            .join(&driver)
            .join("layerdb")
            .join("mounts")
            .join(container_id)
            .join("mount-id");
        let mount_id = std::fs::read_to_string(&mount_id_path)
            .map_err(|e| ExplorerError::io(&mount_id_path, e))?
            .trim()
            .to_string();
        tracing::debug!(container = container_id, mount_id = %mount_id, "container mount id");

        let mount_dir = self.root.join(&driver).join(&mount_id);

        // `lower` is a colon-separated list of paths relative to the
        // driver directory, ordered top-most first.
        let lower_path = mount_dir.join("lower");
        let lower_raw = std::fs::read_to_string(&lower_path)
            .map_err(|e| ExplorerError::io(&lower_path, e))?;
        let lowerdir = lower_raw
            .trim()
            .split(':')
            .filter(|l| !l.is_empty())
            .map(|l| self.root.join(&driver).join(l).display().to_string())
            .collect::<Vec<_>>()
            .join(":");

        Ok(OverlayPaths {
            lowerdir,
            upperdir: mount_dir.join("diff").display().to_string(),
            workdir: mount_dir.join("work").display().to_string(),
        })
    }

    /// Containers selected by the label filter and support policy;
    /// per-container read failures are logged and skipped.
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
                    tracing::info!(container = %c.id, "skipping support container");
                    return false;
                }
                mount::matches_label_filter(c, filter)
            })
            .collect())
    }
}

/// Shape of `repositories.json`: repository name -> (reference -> digest).
#[derive(Debug, serde::Deserialize)]
struct RepositoriesFile {
    #[serde(rename = "Repositories", default)]
    repositories: BTreeMap<String, BTreeMap<String, String>>,
}

/// Shape of an image content document under
/// `image/overlay2/imagedb/content/<algo>/<hex>`.
#[derive(Debug, Default, serde::Deserialize)]
struct ImageContent {
    #[serde(default)]
    created: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

impl DockerExplorer {
    /// Read the image content document for a digest, for its metadata.
    fn image_content(&self, storage_dir: &Path, digest: &str) -> Option<ImageContent> {
        let (algo, hex) = digest.split_once(':')?;
        let path = storage_dir
            .join("imagedb")
            .join("content")
            .join(algo)
            .join(hex);
        let data = std::fs::read(&path).ok()?;
        serde_json::from_slice(&data).ok()
    }
}

impl ContainerExplorer for DockerExplorer {
    fn list_namespaces(&self) -> Result<Vec<String>> {
        if let Some(meta) = &self.meta {
            return meta.view(|tx| Ok(schema::namespaces(tx)));
        }
        Ok(vec!["default".to_string()])
    }

    fn list_containers(&self) -> Result<Vec<Container>> {
        let repositories = self.repositories();

        let mut containers = Vec::new();
        for id in self.container_ids()? {
            self.cancel.check()?;
            match self.ce_container(&id, &repositories) {
                Ok(c) => containers.push(c),
                Err(e) => {
                    tracing::error!(container = %id, error = %e, "reading container config");
                }
            }
        }
        Ok(containers)
    }

    fn list_images(&self) -> Result<Vec<Image>> {
        let image_dir = self.root.join(IMAGE_DIR);
        if !image_dir.is_dir() {
            return Err(ExplorerError::InputMissing(image_dir));
        }

        let mut storage_dirs: Vec<PathBuf> = std::fs::read_dir(&image_dir)
            .map_err(|e| ExplorerError::io(&image_dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        storage_dirs.sort();

        let mut images = Vec::new();
        for storage_dir in storage_dirs {
            self.cancel.check()?;
            let storage_name = storage_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let file = storage_dir.join(REPOSITORIES_FILE);
            let data = match std::fs::read(&file) {
                Ok(d) => d,
                Err(e) => {
                    tracing::debug!(path = %file.display(), error = %e, "no repositories file");
                    continue;
                }
            };
            let doc: RepositoriesFile = serde_json::from_slice(&data)?;

            for names in doc.repositories.values() {
                for (name, digest) in names {
                    let mut image = Image {
                        namespace: "default".to_string(),
                        name: name.clone(),
                        media_type: String::new(),
                        digest: digest.clone(),
                        size: 0,
                        created_at: None,
                        updated_at: None,
                        labels: BTreeMap::new(),
                        support_container_image: support::is_support_image(
                            self.policy.as_ref(),
                            &image_basename(name),
                        ),
                    };
                    if storage_name == OVERLAY2 {
                        if let Some(content) = self.image_content(&storage_dir, digest) {
                            image.created_at = content.created;
                            tracing::debug!(
                                image = %name,
                                architecture = %content.architecture,
                                os = %content.os,
                                "image content record"
                            );
                        }
                    }
                    images.push(image);
                }
            }
        }
        Ok(images)
    }

    fn list_content(&self) -> Result<Vec<Content>> {
        tracing::info!("content listing is not available for the docker backend");
        Ok(Vec::new())
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotKeyInfo>> {
        tracing::info!("snapshot listing is not available for the docker backend");
        Ok(Vec::new())
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for container in self.list_containers()? {
            tasks.push(Task {
                namespace: container.namespace.clone(),
                name: container.id.clone(),
                pid: container.process_id,
                container_type: ContainerType::Docker,
                status: container.status,
            });
        }
        Ok(tasks)
    }

    fn info_container(&self, container_id: &str, spec_only: bool) -> Result<serde_json::Value> {
        let path = self
            .root
            .join(CONTAINERS_DIR)
            .join(container_id)
            .join(CONFIG_V2);
        let data = std::fs::read(&path)
            .map_err(|_| ExplorerError::NotFound(container_id.to_string()))?;
        let value: serde_json::Value = serde_json::from_slice(&data)?;

        if spec_only {
            return Ok(value.get("Config").cloned().unwrap_or(serde_json::Value::Null));
        }
        Ok(value)
    }

    fn mount_container(&self, container_id: &str, mountpoint: &Path) -> Result<()> {
        let paths = self.overlay_paths(container_id)?;
        tracing::debug!(
            lowerdir = %paths.lowerdir,
            upperdir = %paths.upperdir,
            workdir = %paths.workdir,
            "container overlay directories"
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
        let containers = self.selected_containers(filter, skip_support_containers)?;
        if containers.is_empty() {
            return Err(ExplorerError::NotFound("no containers selected".to_string()));
        }

        for container in containers {
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
        let containers = match container_id {
            Some(id) => {
                let repositories = self.repositories();
                vec![self.ce_container(id, &repositories)?]
            }
            None => self.selected_containers(filter, skip_support_containers)?,
        };

        let mut drifts = Vec::new();
        for container in containers {
            self.cancel.check()?;
            let paths = match self.overlay_paths(&container.id) {
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
        // Verify the container exists before mounting anything.
        if !self
            .container_ids()?
            .iter()
            .any(|id| id == container_id)
        {
            return Err(ExplorerError::NotFound(container_id.to_string()));
        }
        std::fs::create_dir_all(output_dir).map_err(|e| ExplorerError::io(output_dir, e))?;

        let mut temp_mount = TempMount::create(self.exec.as_ref())?;
        tracing::info!(
            container = container_id,
            mountpoint = %temp_mount.path().display(),
            "mounting container for export"
        );
        self.mount_container(container_id, temp_mount.path())?;
        temp_mount.mark_mounted();

        export::export_mounted(
            self.exec.as_ref(),
            container_id,
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

    fn snapshot_root(&self, _snapshotter: &str) -> String {
        // Docker's overlay layout has no snapshotter database root.
        "unknown".to_string()
    }

    fn close(self: Box<Self>) {
        if let Some(meta) = self.meta {
            meta.close();
        }
    }
}
