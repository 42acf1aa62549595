//! Drift detection: what a container changed on top of its image.
//!
//! Overlayfs keeps a container's runtime writes in the upper (diff)
//! directory, so drift is computed by walking that directory rather than
//! the mounted union view, where the overlay semantics are explicit:
//!
//! - regular files are additions or modifications of the lower tree;
//! - a character device with device number `0,0` is a whiteout masking a
//!   deleted file;
//! - a directory carrying the xattr `trusted.overlay.opaque=y` (or the
//!   unprivileged `user.overlay.opaque=y`) replaces the lower directory
//!   wholesale.
//!
//! Entries the walker cannot stat are reported in the inaccessible list
//! with an error marker instead of failing the walk.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ExplorerError, Result};

/// Classification of a drift entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftFileType {
    Regular,
    /// Regular file with any execute bit set.
    Executable,
    /// Overlayfs whiteout: a deleted file in the lower tree.
    Whiteout,
    /// Directory whose children replace the lower directory entirely.
    OpaqueDir,
    Symlink,
    Other,
}

/// Per-file metadata recorded for a forensic report.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub file_name: String,
    /// Path relative to the diff directory, with a leading `/`.
    pub full_path: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_accessed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_changed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_birth: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_sha256: Option<String>,
    pub file_type: DriftFileType,
    /// Set when the entry could not be fully examined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filesystem changes of one container.
#[derive(Debug, Clone, Serialize)]
pub struct Drift {
    pub container_id: String,
    /// Files the container added or modified, including opaque directories
    /// and symlinks.
    pub added_or_modified: Vec<FileInfo>,
    /// Whiteouts (deletions) and entries the walker could not examine.
    pub inaccessible_files: Vec<FileInfo>,
}

/// Options for the drift walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftOptions {
    /// Skip hashing files larger than this many bytes. No bound by
    /// default.
    pub max_hash_size: Option<u64>,
}

/// True when a directory entry is an overlayfs whiteout: a character
/// device with major and minor number both zero.
#[cfg(unix)]
pub fn is_overlay_whiteout(file_type: std::fs::FileType, rdev: u64) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_char_device() && rustix::fs::major(rdev) == 0 && rustix::fs::minor(rdev) == 0
}

#[cfg(not(unix))]
pub fn is_overlay_whiteout(_file_type: std::fs::FileType, _rdev: u64) -> bool {
    false
}

/// True when a directory carries the overlay opaque marker.
#[cfg(unix)]
fn is_opaque_dir(path: &Path) -> bool {
    let mut value = [0u8; 4];
    for name in ["trusted.overlay.opaque", "user.overlay.opaque"] {
        if let Ok(n) = rustix::fs::getxattr(path, name, &mut value) {
            if value.get(..n) == Some(b"y") {
                return true;
            }
        }
    }
    false
}

#[cfg(not(unix))]
fn is_opaque_dir(_path: &Path) -> bool {
    false
}

/// Streaming SHA-256 of a file.
fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| ExplorerError::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| ExplorerError::io(path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn system_time_to_utc(t: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    t.ok().map(DateTime::<Utc>::from)
}

/// Build a [`FileInfo`] from an entry's metadata.
fn file_info(
    path: &Path,
    rel: &str,
    meta: &std::fs::Metadata,
    file_type: DriftFileType,
    opts: &DriftOptions,
) -> FileInfo {
    #[cfg(unix)]
    let (uid, gid, changed) = {
        use std::os::unix::fs::MetadataExt;
        let changed = DateTime::<Utc>::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32);
        (Some(meta.uid()), Some(meta.gid()), changed)
    };
    #[cfg(not(unix))]
    let (uid, gid, changed) = (None, None, None);

    let hash = match file_type {
        DriftFileType::Regular | DriftFileType::Executable => {
            let within_bound = opts.max_hash_size.is_none_or(|max| meta.len() <= max);
            if within_bound {
                match file_sha256(path) {
                    Ok(h) => Some(h),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "hashing drift file");
                        None
                    }
                }
            } else {
                None
            }
        }
        _ => None,
    };

    FileInfo {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        full_path: rel.to_string(),
        file_size: meta.len(),
        file_modified: system_time_to_utc(meta.modified()),
        file_accessed: system_time_to_utc(meta.accessed()),
        file_changed: changed,
        file_birth: system_time_to_utc(meta.created()),
        file_uid: uid,
        file_gid: gid,
        file_sha256: hash,
        file_type,
        error: None,
    }
}

/// Walk a container's diff directory and classify every entry.
///
/// The diff directory itself must exist; everything below it is
/// best-effort. The added and inaccessible lists are disjoint by full
/// path.
pub fn diff_directory(container_id: &str, diff_dir: &Path, opts: &DriftOptions) -> Result<Drift> {
    if !diff_dir.is_dir() {
        return Err(ExplorerError::InputMissing(diff_dir.to_path_buf()));
    }

    let mut added: BTreeMap<String, FileInfo> = BTreeMap::new();
    let mut inaccessible: BTreeMap<String, FileInfo> = BTreeMap::new();

    let walker = walkdir::WalkDir::new(diff_dir)
        .min_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(diff_dir, p))
                    .unwrap_or_default();
                inaccessible.insert(
                    path.clone(),
                    inaccessible_info(&path, e.to_string()),
                );
                continue;
            }
        };

        let path = entry.path();
        let rel = relative_path(diff_dir, path);

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                inaccessible.insert(rel.clone(), inaccessible_info(&rel, e.to_string()));
                continue;
            }
        };

        #[cfg(unix)]
        let rdev = {
            use std::os::unix::fs::MetadataExt;
            meta.rdev()
        };
        #[cfg(not(unix))]
        let rdev = 0u64;

        let ftype = meta.file_type();
        if is_overlay_whiteout(ftype, rdev) {
            let info = file_info(path, &rel, &meta, DriftFileType::Whiteout, opts);
            inaccessible.insert(rel, info);
        } else if ftype.is_dir() {
            if is_opaque_dir(path) {
                let info = file_info(path, &rel, &meta, DriftFileType::OpaqueDir, opts);
                added.insert(rel, info);
            }
        } else if ftype.is_symlink() {
            let info = file_info(path, &rel, &meta, DriftFileType::Symlink, opts);
            added.insert(rel, info);
        } else if ftype.is_file() {
            #[cfg(unix)]
            let executable = {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o111 != 0
            };
            #[cfg(not(unix))]
            let executable = false;

            let tag = if executable {
                DriftFileType::Executable
            } else {
                DriftFileType::Regular
            };
            let info = file_info(path, &rel, &meta, tag, opts);
            added.insert(rel, info);
        } else {
            let info = file_info(path, &rel, &meta, DriftFileType::Other, opts);
            added.insert(rel, info);
        }
    }

    // A path reported inaccessible must not also appear as added.
    for path in inaccessible.keys() {
        added.remove(path);
    }

    Ok(Drift {
        container_id: container_id.to_string(),
        added_or_modified: added.into_values().collect(),
        inaccessible_files: inaccessible.into_values().collect(),
    })
}

fn relative_path(diff_dir: &Path, path: &Path) -> String {
    match path.strip_prefix(diff_dir) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => path.display().to_string(),
    }
}

fn inaccessible_info(rel: &str, error: String) -> FileInfo {
    FileInfo {
        file_name: rel.rsplit('/').next().unwrap_or_default().to_string(),
        full_path: rel.to_string(),
        file_size: 0,
        file_modified: None,
        file_accessed: None,
        file_changed: None,
        file_birth: None,
        file_uid: None,
        file_gid: None,
        file_sha256: None,
        file_type: DriftFileType::Other,
        error: Some(error),
    }
}
