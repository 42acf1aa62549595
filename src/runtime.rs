//! Runtime-state reconstruction from a captured image.
//!
//! The runtimes are dead, but their control-plane residue is still on the
//! disk: cgroup v2 pseudo-files under `<image-root>/sys/fs/cgroup` and runc
//! state files under `<image-root>/run/containerd/runc`. This module maps
//! that residue back to a per-container execution status and init PID.
//!
//! Status mapping from `cgroup.events`:
//!
//! | populated | frozen | status  |
//! |-----------|--------|---------|
//! | 0         | 0      | STOPPED |
//! | 1         | 0      | RUNNING |
//! | 1         | 1      | PAUSED  |
//! | anything else      | UNKNOWN |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::ContainerType;
use crate::error::{ExplorerError, Result};

/// Execution status of a container task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => f.write_str("CREATED"),
            TaskStatus::Running => f.write_str("RUNNING"),
            TaskStatus::Paused => f.write_str("PAUSED"),
            TaskStatus::Stopped => f.write_str("STOPPED"),
            TaskStatus::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Task state reconstructed for one container.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub namespace: String,
    /// Container id the task belongs to.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    pub container_type: ContainerType,
    pub status: TaskStatus,
}

/// The subset of runc's `state.json` the explorer reads. Captured images
/// taken mid-transition can have missing or empty fields; everything
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuncState {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub init_process_pid: i64,
    #[serde(default)]
    pub init_process_start: u64,
    #[serde(default)]
    pub rootless: bool,
}

/// Map a spec `linux.cgroupsPath` to the absolute cgroup directory inside
/// the captured image, recognizing both encodings:
///
/// - containerd: `<scope>/<id>` under `sys/fs/cgroup`
/// - Docker/systemd: `system.slice:docker:<id>` maps to
///   `sys/fs/cgroup/system.slice/docker-<id>.scope`
///
/// Returns the path plus the container type the encoding implies.
pub fn cgroup_dir(image_root: &Path, cgroups_path: &str) -> Result<(PathBuf, ContainerType)> {
    let cgroup_root = image_root.join("sys").join("fs").join("cgroup");

    if cgroups_path.contains("docker") {
        let parts: Vec<&str> = cgroups_path.split(':').collect();
        if parts.len() != 3 {
            return Err(ExplorerError::SchemaAbsent(format!(
                "expected <slice>:<prefix>:<id> cgroups path, got {cgroups_path:?}"
            )));
        }
        let scope = format!("{}-{}.scope", parts[1], parts[2]);
        Ok((cgroup_root.join(parts[0]).join(scope), ContainerType::Docker))
    } else {
        let rel = cgroups_path.trim_start_matches('/');
        Ok((cgroup_root.join(rel), ContainerType::Containerd))
    }
}

/// Parse `cgroup.events` into `(populated, frozen)`; either is `None` when
/// its line is missing or malformed.
pub fn read_cgroup_events(cgroup_dir: &Path) -> Result<(Option<u32>, Option<u32>)> {
    let path = cgroup_dir.join("cgroup.events");
    let data = std::fs::read_to_string(&path).map_err(|e| ExplorerError::io(&path, e))?;

    let mut populated = None;
    let mut frozen = None;
    for line in data.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("populated"), Some(v)) => populated = v.parse().ok(),
            (Some("frozen"), Some(v)) => frozen = v.parse().ok(),
            _ => {}
        }
    }
    Ok((populated, frozen))
}

/// Derive the task status from a cgroup directory.
pub fn task_status(cgroup_dir: &Path) -> TaskStatus {
    match read_cgroup_events(cgroup_dir) {
        Ok((Some(0), Some(0))) => TaskStatus::Stopped,
        Ok((Some(1), Some(0))) => TaskStatus::Running,
        Ok((Some(1), Some(1))) => TaskStatus::Paused,
        Ok((populated, frozen)) => {
            tracing::debug!(
                path = %cgroup_dir.display(),
                ?populated,
                ?frozen,
                "unrecognized cgroup.events state"
            );
            TaskStatus::Unknown
        }
        Err(e) => {
            tracing::debug!(path = %cgroup_dir.display(), error = %e, "reading cgroup.events");
            TaskStatus::Unknown
        }
    }
}

/// The init PID: first line of `cgroup.procs`. `None` when the file is
/// missing, empty, or unparsable.
pub fn task_pid(cgroup_dir: &Path) -> Option<i64> {
    let data = std::fs::read_to_string(cgroup_dir.join("cgroup.procs")).ok()?;
    data.lines().next()?.trim().parse().ok()
}

/// Read the runc state file for a container,
/// `<image-root>/run/containerd/runc/<ns>/<id>/state.json`.
pub fn runc_state(image_root: &Path, namespace: &str, id: &str) -> Result<RuncState> {
    let path = image_root
        .join("run")
        .join("containerd")
        .join("runc")
        .join(namespace)
        .join(id)
        .join("state.json");
    let data = std::fs::read(&path).map_err(|e| ExplorerError::io(&path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Reconstruct the task for one container from its cgroup residue, falling
/// back to the runc state file for the PID when the cgroup is gone.
pub fn reconstruct_task(
    image_root: &Path,
    namespace: &str,
    id: &str,
    cgroups_path: Option<&str>,
) -> Task {
    let mut task = Task {
        namespace: namespace.to_string(),
        name: id.to_string(),
        pid: None,
        container_type: ContainerType::Containerd,
        status: TaskStatus::Unknown,
    };

    let dir = cgroups_path.and_then(|p| match cgroup_dir(image_root, p) {
        Ok((dir, ctype)) => {
            task.container_type = ctype;
            Some(dir)
        }
        Err(e) => {
            tracing::debug!(container = id, error = %e, "deriving cgroup path");
            None
        }
    });

    if let Some(dir) = dir.filter(|d| d.is_dir()) {
        task.status = task_status(&dir);
        task.pid = task_pid(&dir);
    }

    // The cgroup may already be gone for a deleted container; runc's state
    // file can still name the init pid.
    if task.pid.is_none() && task.container_type == ContainerType::Containerd {
        match runc_state(image_root, namespace, id) {
            Ok(state) if state.init_process_pid != 0 => {
                task.pid = Some(state.init_process_pid);
            }
            Ok(_) => {}
            Err(ExplorerError::InputMissing(_)) => {}
            Err(e) => {
                tracing::debug!(container = id, error = %e, "reading runc state");
            }
        }
    }

    task
}
