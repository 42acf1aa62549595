//! Container export: gzip archives and raw ext4 images.
//!
//! Both exports operate on an already mounted container root. The archive
//! path is a single `tar` invocation; the raw image path sizes an ext4
//! image from the mounted content, formats it, loop-mounts it and copies
//! the tree in. Every temporary resource (loop device, image mount, temp
//! directory) is paired with a guard that releases it on all exit paths;
//! stale loop devices on an analysis workstation are observable and must
//! not occur.

use std::path::{Path, PathBuf};

use crate::error::{ExplorerError, Result};
use crate::exec::CommandExecutor;

/// What to produce for an exported container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Produce `<id>.img`, a raw ext4 image.
    pub image: bool,
    /// Produce `<id>.tar.gz`.
    pub archive: bool,
}

/// Fixed base overhead added to the measured content size of a raw image.
const IMAGE_BASE_OVERHEAD: u64 = 20 * 1024 * 1024;

/// Total size reserved for the content plus filesystem structures. The
/// divisor is inherited behavior; treat the result as an upper bound.
pub fn raw_image_size(content_size: u64) -> u64 {
    content_size + IMAGE_BASE_OVERHEAD + content_size / 20
}

/// Total size in bytes of all regular files under `root`. Symlinked files
/// are counted at their target's size; broken symlinks are skipped.
pub fn directory_content_size(root: &Path) -> Result<u64> {
    if !root.is_dir() {
        return Err(ExplorerError::InputMissing(root.to_path_buf()));
    }

    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            match e.into_io_error() {
                Some(io) => ExplorerError::io(path, io),
                None => ExplorerError::InputMissing(path),
            }
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        // Follow file symlinks to size their target.
        match std::fs::metadata(entry.path()) {
            Ok(meta) if meta.is_file() => total += meta.len(),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %entry.path().display(), "skipping broken symlink");
            }
            Err(e) => return Err(ExplorerError::io(entry.path(), e)),
        }
    }
    Ok(total)
}

/// Create `<output_dir>/<id>.tar.gz` from a mounted container root.
pub fn export_archive(
    exec: &dyn CommandExecutor,
    container_id: &str,
    mountpoint: &Path,
    output_dir: &Path,
) -> Result<()> {
    let archive = output_dir.join(format!("{container_id}.tar.gz"));
    tracing::info!(
        container = container_id,
        archive = %archive.display(),
        "creating container archive"
    );

    let archive = archive.display().to_string();
    let mountpoint = mountpoint.display().to_string();
    exec.execute("tar", &["-czf", &archive, "-C", &mountpoint, "."])?;
    Ok(())
}

/// Unmounts the image mount and detaches the loop device when dropped.
struct LoopCleanup<'e> {
    exec: &'e dyn CommandExecutor,
    mounted_at: Option<PathBuf>,
    loop_device: Option<String>,
}

impl Drop for LoopCleanup<'_> {
    fn drop(&mut self) {
        if let Some(dir) = self.mounted_at.take() {
            if let Err(e) = self.exec.execute("umount", &[&dir.display().to_string()]) {
                tracing::warn!(mountpoint = %dir.display(), error = %e, "unmounting image");
            }
        }
        if let Some(dev) = self.loop_device.take() {
            if let Err(e) = self.exec.execute("losetup", &["-d", &dev]) {
                tracing::warn!(device = %dev, error = %e, "detaching loop device");
            }
        }
    }
}

/// Create `<output_dir>/<id>.img`: a sparse ext4 image populated with the
/// mounted container's content.
pub fn export_raw_image(
    exec: &dyn CommandExecutor,
    container_id: &str,
    mountpoint: &Path,
    output_dir: &Path,
) -> Result<()> {
    let content_size = directory_content_size(mountpoint)?;
    let image_size = raw_image_size(content_size);
    let image_path = output_dir.join(format!("{container_id}.img"));
    tracing::info!(
        container = container_id,
        image = %image_path.display(),
        content_size,
        image_size,
        "creating raw image"
    );

    let file = std::fs::File::create(&image_path)
        .map_err(|e| ExplorerError::io(&image_path, e))?;
    file.set_len(image_size)
        .map_err(|e| ExplorerError::io(&image_path, e))?;
    file.sync_all()
        .map_err(|e| ExplorerError::io(&image_path, e))?;
    drop(file);

    let image_str = image_path.display().to_string();
    exec.execute("mkfs.ext4", &["-F", "-q", &image_str])?;

    // Temp directory inside the output dir keeps the image mount on the
    // same filesystem tree the investigator chose.
    let image_mount = tempfile::Builder::new()
        .prefix(&format!("{container_id}-img-mount-"))
        .tempdir_in(output_dir)
        .map_err(|e| ExplorerError::io(output_dir, e))?;

    let mut cleanup = LoopCleanup {
        exec,
        mounted_at: None,
        loop_device: None,
    };

    let loop_device = exec
        .execute("losetup", &["-f", "--show", &image_str])?
        .stdout
        .trim()
        .to_string();
    if loop_device.is_empty() {
        return Err(ExplorerError::ShimFailure {
            argv: vec![
                "losetup".into(),
                "-f".into(),
                "--show".into(),
                image_str.clone(),
            ],
            output: "losetup returned an empty loop device path".into(),
        });
    }
    cleanup.loop_device = Some(loop_device.clone());

    let image_mount_str = image_mount.path().display().to_string();
    exec.execute("mount", &[&loop_device, &image_mount_str])?;
    cleanup.mounted_at = Some(image_mount.path().to_path_buf());

    // Copy the mounted container's top-level entries, preserving metadata.
    let entries = std::fs::read_dir(mountpoint).map_err(|e| ExplorerError::io(mountpoint, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ExplorerError::io(mountpoint, e))?;
        exec.execute(
            "cp",
            &["-a", &entry.path().display().to_string(), &image_mount_str],
        )?;
    }

    exec.execute("sync", &[])?;

    // Cleanup guard unmounts and detaches; the temp dir removes itself.
    drop(cleanup);
    drop(image_mount);

    Ok(())
}

/// Export a mounted container as the selected artifacts.
pub fn export_mounted(
    exec: &dyn CommandExecutor,
    container_id: &str,
    mountpoint: &Path,
    output_dir: &Path,
    options: ExportOptions,
) -> Result<()> {
    if options.image {
        export_raw_image(exec, container_id, mountpoint, output_dir)?;
    }
    if options.archive {
        export_archive(exec, container_id, mountpoint, output_dir)?;
    }
    Ok(())
}

/// An ephemeral mountpoint that is unmounted and removed when dropped.
pub struct TempMount<'e> {
    exec: &'e dyn CommandExecutor,
    path: PathBuf,
    mounted: bool,
}

impl<'e> TempMount<'e> {
    /// Create a fresh random mountpoint directory under `/mnt`.
    pub fn create(exec: &'e dyn CommandExecutor) -> Result<TempMount<'e>> {
        let path = crate::mount::random_mountpoint();
        std::fs::create_dir_all(&path).map_err(|e| ExplorerError::io(&path, e))?;
        Ok(TempMount {
            exec,
            path,
            mounted: false,
        })
    }

    /// Record that something is now mounted at the path, arming the
    /// unmount on drop.
    pub fn mark_mounted(&mut self) {
        self.mounted = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempMount<'_> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = crate::mount::unmount(self.exec, &self.path) {
                tracing::warn!(mountpoint = %self.path.display(), error = %e, "unmounting");
            }
        }
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(mountpoint = %self.path.display(), error = %e, "removing mountpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::RecordingExecutor;
    use std::fs;

    #[test]
    fn image_size_heuristic() {
        assert_eq!(raw_image_size(0), 20 * 1024 * 1024);
        assert_eq!(raw_image_size(100 * 1024 * 1024), 125 * 1024 * 1024);
    }

    #[test]
    fn content_size_counts_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("a"), dir.path().join("link")).unwrap();

        let size = directory_content_size(dir.path()).unwrap();
        #[cfg(unix)]
        assert_eq!(size, 250); // symlinked file counted at target size
        #[cfg(not(unix))]
        assert_eq!(size, 150);
    }

    #[test]
    fn archive_argv() {
        let exec = RecordingExecutor::default();
        export_archive(&exec, "c1", Path::new("/mnt/abc"), Path::new("/out")).unwrap();
        assert_eq!(
            exec.argv_log(),
            vec![vec![
                "tar".to_string(),
                "-czf".to_string(),
                "/out/c1.tar.gz".to_string(),
                "-C".to_string(),
                "/mnt/abc".to_string(),
                ".".to_string(),
            ]]
        );
    }

    #[test]
    fn raw_image_command_sequence_and_cleanup() {
        let mount_src = tempfile::tempdir().unwrap();
        fs::write(mount_src.path().join("rootfile"), b"data").unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut exec = RecordingExecutor::default();
        exec.stdout
            .insert("losetup".to_string(), "/dev/loop7\n".to_string());

        export_raw_image(&exec, "c1", mount_src.path(), out.path()).unwrap();

        let programs: Vec<String> = exec
            .argv_log()
            .iter()
            .map(|argv| argv[0].clone())
            .collect();
        assert_eq!(
            programs,
            vec!["mkfs.ext4", "losetup", "mount", "cp", "sync", "umount", "losetup"]
        );

        // The final losetup detaches the device the first one returned.
        let calls = exec.argv_log();
        let detach = calls.last().unwrap();
        assert_eq!(detach[1..], ["-d".to_string(), "/dev/loop7".to_string()]);

        // The sparse image exists and has the expected reserved size.
        let img = out.path().join("c1.img");
        assert_eq!(fs::metadata(&img).unwrap().len(), raw_image_size(4));
    }

    #[test]
    fn raw_image_detaches_loop_on_mount_failure() {
        let mount_src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let mut exec = RecordingExecutor::default();
        exec.stdout
            .insert("losetup".to_string(), "/dev/loop3\n".to_string());
        exec.failing.push("mount".to_string());

        let err = export_raw_image(&exec, "c1", mount_src.path(), out.path()).unwrap_err();
        assert!(matches!(err, ExplorerError::ShimFailure { .. }));

        // Even on failure the loop device must be detached.
        let calls = exec.argv_log();
        let detach = calls.last().unwrap();
        assert_eq!(detach[0], "losetup");
        assert_eq!(detach[1..], ["-d".to_string(), "/dev/loop3".to_string()]);
        // No unmount: the image mount never succeeded.
        assert!(!calls.iter().any(|argv| argv[0] == "umount"));
    }
}
