//! Overlay mount composition and the mount-all selection policy.
//!
//! A container is mounted by composing a read-only overlay of its resolved
//! layer chain. The container's own upper layer is prepended to the
//! colon-separated lower list, so its runtime writes sit above the image
//! layers while the whole union stays read-only:
//!
//! ```text
//! mount -t overlay overlay -o ro,lowerdir=<upperdir>:<lowerdir> <mountpoint>
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::container::Container;
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::snapshot::OverlayPaths;

/// Compose the overlay mount option string from resolved paths. The lower
/// list is emitted exactly as resolved; ordering is first-listed-wins.
pub fn overlay_options(paths: &OverlayPaths) -> String {
    format!("ro,lowerdir={}:{}", paths.upperdir, paths.lowerdir)
}

/// Mount a resolved overlay at `mountpoint` through the executor.
pub fn mount_overlay(
    exec: &dyn CommandExecutor,
    paths: &OverlayPaths,
    mountpoint: &Path,
) -> Result<()> {
    let options = overlay_options(paths);
    let mountpoint = mountpoint.display().to_string();
    let args: [&str; 6] = ["-t", "overlay", "overlay", "-o", &options, &mountpoint];
    tracing::debug!(?args, "mounting overlay");

    let out = exec.execute("mount", &args)?;
    if !out.combined().is_empty() {
        tracing::info!(output = %out.combined(), "mount command output");
    }
    Ok(())
}

/// Unmount a previously mounted path.
pub fn unmount(exec: &dyn CommandExecutor, mountpoint: &Path) -> Result<()> {
    let mountpoint = mountpoint.display().to_string();
    exec.execute("umount", &[mountpoint.as_str()])?;
    Ok(())
}

/// Parse a comma-separated `key=value` label filter. Malformed pairs are
/// ignored.
pub fn parse_label_filter(filter: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in filter.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

/// A container is selected when, for every filter pair, its label for that
/// key equals the value. A missing label excludes it; an empty filter
/// selects everything.
pub fn matches_label_filter(container: &Container, filter: &BTreeMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| container.labels.get(k) == Some(v))
}

const MOUNT_NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MOUNT_NAME_LEN: usize = 6;

/// Generate a random mountpoint path under `/mnt`, retrying until the path
/// does not exist yet. Randomness avoids collisions between concurrent
/// sessions; the OS-seeded generator is drawn per call.
pub fn random_mountpoint() -> PathBuf {
    let mut rng = rand::rng();
    loop {
        let name: String = (0..MOUNT_NAME_LEN)
            .map(|_| MOUNT_NAME_CHARSET[rng.random_range(0..MOUNT_NAME_CHARSET.len())] as char)
            .collect();
        let candidate = Path::new("/mnt").join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerType, image_basename};
    use crate::exec::testing::RecordingExecutor;
    use crate::runtime::TaskStatus;

    fn container_with_labels(labels: &[(&str, &str)]) -> Container {
        Container {
            namespace: "default".into(),
            id: "c1".into(),
            image: "nginx:latest".into(),
            image_base: image_basename("nginx:latest"),
            hostname: String::new(),
            snapshotter: "overlayfs".into(),
            snapshot_key: String::new(),
            runtime: None,
            created_at: None,
            updated_at: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            spec: None,
            support_container: false,
            container_type: ContainerType::Containerd,
            process_id: None,
            status: TaskStatus::Unknown,
            running: false,
            exposed_ports: Vec::new(),
        }
    }

    #[test]
    fn option_string_prepends_upper() {
        let paths = OverlayPaths {
            lowerdir: "/root/snapshots/17/fs:/root/snapshots/3/fs".into(),
            upperdir: "/root/snapshots/42/fs".into(),
            workdir: "/root/snapshots/42/work".into(),
        };
        assert_eq!(
            overlay_options(&paths),
            "ro,lowerdir=/root/snapshots/42/fs:/root/snapshots/17/fs:/root/snapshots/3/fs"
        );
    }

    #[test]
    fn mount_invokes_expected_argv() {
        let exec = RecordingExecutor::default();
        let paths = OverlayPaths {
            lowerdir: "/l1:/l2".into(),
            upperdir: "/u".into(),
            workdir: "/w".into(),
        };
        mount_overlay(&exec, &paths, Path::new("/mnt/x")).unwrap();

        let calls = exec.argv_log();
        assert_eq!(
            calls,
            vec![vec![
                "mount".to_string(),
                "-t".to_string(),
                "overlay".to_string(),
                "overlay".to_string(),
                "-o".to_string(),
                "ro,lowerdir=/u:/l1:/l2".to_string(),
                "/mnt/x".to_string(),
            ]]
        );
    }

    #[test]
    fn label_filter_parsing() {
        let filter = parse_label_filter("app=web, tier=front,malformed,=,x=");
        assert_eq!(filter.get("app").map(String::as_str), Some("web"));
        assert_eq!(filter.get("tier").map(String::as_str), Some("front"));
        assert_eq!(filter.get("x").map(String::as_str), Some(""));
        assert!(!filter.contains_key("malformed"));
    }

    #[test]
    fn label_filter_selection() {
        let c = container_with_labels(&[("app", "web"), ("tier", "front")]);

        assert!(matches_label_filter(&c, &parse_label_filter("")));
        assert!(matches_label_filter(&c, &parse_label_filter("app=web")));
        assert!(matches_label_filter(
            &c,
            &parse_label_filter("app=web,tier=front")
        ));
        // Wrong value, and missing key: both exclude.
        assert!(!matches_label_filter(&c, &parse_label_filter("app=api")));
        assert!(!matches_label_filter(&c, &parse_label_filter("zone=us")));
    }

    #[test]
    fn random_mountpoints_differ() {
        let a = random_mountpoint();
        let b = random_mountpoint();
        assert!(a.starts_with("/mnt"));
        // Two draws colliding would mean the generator is not seeded.
        assert_ne!(a, b);
    }
}
