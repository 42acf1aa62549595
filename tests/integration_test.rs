//! End-to-end tests for the containerd backend over synthesized databases.
//!
//! The fixtures are real bolt-format files written by `common`, laid out
//! the way a captured disk presents them, so these tests exercise the full
//! path: page parsing, schema decoding, chain resolution, overlay
//! composition and the privileged-command surface (through a recording
//! executor).

mod common;

use std::path::{Path, PathBuf};

use common::{any_spec, snapshot_node, varint, write_bolt_db, FixtureBucket, RecordingExecutor};

use coldctr::{
    ContainerExplorer, ContainerdExplorer, ContainerdOptions, ExplorerError, SnapshotKind,
    SupportContainerPolicy, TaskStatus,
};

const SNAPSHOTTER_DIR: &str = "io.containerd.snapshotter.v1.overlayfs";

/// Write the meta.db fixture under the given containerd root.
fn write_meta_db(containerd_root: &Path) {
    let mut root = FixtureBucket::new();
    {
        let v1 = root.bucket("v1");
        let ns = v1.bucket("default");

        let containers = ns.bucket("containers");
        {
            let ctr = containers.bucket("nginx-web");
            ctr.leaf("image", "docker.io/library/nginx:latest");
            ctr.leaf("snapshotter", "overlayfs");
            ctr.leaf("snapshotKey", "sha256:aaa");
            ctr.leaf("createdat", b"2023-04-01T10:00:00.000000000Z".to_vec());
            ctr.leaf("updatedat", b"2023-04-02T11:30:00.000000000Z".to_vec());
            ctr.bucket("labels").leaf("app", "web");
            ctr.bucket("runtime").leaf("name", "io.containerd.runc.v2");
            ctr.leaf(
                "spec",
                any_spec(
                    r#"{"ociVersion":"1.0.2","hostname":"web-host",
                        "process":{"env":["PATH=/usr/bin","HOSTNAME=ignored"]},
                        "linux":{"cgroupsPath":"/default/nginx-web"}}"#,
                ),
            );
        }
        {
            // A base-image container: chain of length 1.
            let ctr = containers.bucket("base-only");
            ctr.leaf("image", "docker.io/library/alpine:3.18");
            ctr.leaf("snapshotter", "overlayfs");
            ctr.leaf("snapshotKey", "sha256:ccc");
        }
        {
            let ctr = containers.bucket("dangly");
            ctr.leaf("image", "docker.io/library/broken:1");
            ctr.leaf("snapshotter", "overlayfs");
            ctr.leaf("snapshotKey", "sha256:dang");
        }
        {
            let ctr = containers.bucket("loopy");
            ctr.leaf("image", "docker.io/library/broken:2");
            ctr.leaf("snapshotter", "overlayfs");
            ctr.leaf("snapshotKey", "sha256:loop1");
        }

        let images = ns.bucket("images");
        {
            let img = images.bucket("docker.io/library/nginx:latest");
            img.leaf("createdat", b"2023-03-01T00:00:00.000000000Z".to_vec());
            img.leaf("updatedat", b"2023-03-01T00:00:00.000000000Z".to_vec());
            let target = img.bucket("target");
            target.leaf("digest", "sha256:605c77e624dd");
            target.leaf(
                "mediatype",
                "application/vnd.docker.distribution.manifest.list.v2+json",
            );
            target.leaf("size", varint(1862));
        }

        let blobs = ns.bucket("content").bucket("blob");
        {
            let blob = blobs.bucket("sha256:feedface01");
            blob.leaf("size", varint(4096));
            blob.leaf("createdat", b"2023-03-01T00:00:00.000000000Z".to_vec());
            blob.bucket("labels")
                .leaf("containerd.io/gc.root", "2023-03-01");
        }

        let snapshotter = ns.bucket("snapshots").bucket("overlayfs");
        snapshot_node(snapshotter.bucket("sha256:aaa"), "sha256:aaa", "sha256:bbb");
        snapshot_node(snapshotter.bucket("sha256:bbb"), "sha256:bbb", "sha256:ccc");
        snapshot_node(snapshotter.bucket("sha256:ccc"), "sha256:ccc", "");
        snapshot_node(snapshotter.bucket("sha256:dang"), "sha256:dang", "sha256:missing");
        snapshot_node(snapshotter.bucket("sha256:loop1"), "sha256:loop1", "sha256:loop2");
        snapshot_node(snapshotter.bucket("sha256:loop2"), "sha256:loop2", "sha256:loop1");

        // A second, empty namespace: enumeration must still surface it.
        v1.bucket("k8s.io");
    }

    write_bolt_db(
        &containerd_root.join("io.containerd.metadata.v1.bolt/meta.db"),
        &root,
    );
}

/// Write the snapshotter metadata.db fixture.
fn write_snapshot_db(containerd_root: &Path) {
    let mut root = FixtureBucket::new();
    {
        let snapshots = root.bucket("v1").bucket("snapshots");
        for (name, id, kind, parent) in [
            ("sha256:aaa", 42u64, 2u64, "sha256:bbb"),
            ("sha256:bbb", 17, 3, "sha256:ccc"),
            ("sha256:ccc", 3, 3, ""),
        ] {
            let node = snapshots.bucket(name);
            node.leaf("id", varint(id));
            node.leaf("kind", varint(kind));
            node.leaf("size", varint(0));
            node.leaf("parent", parent.as_bytes().to_vec());
        }
    }
    write_bolt_db(
        &containerd_root.join(SNAPSHOTTER_DIR).join("metadata.db"),
        &root,
    );
}

struct Fixture {
    _dir: tempfile::TempDir,
    containerd_root: PathBuf,
    image_root: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let containerd_root = dir.path().join("var/lib/containerd");
    let image_root = dir.path().to_path_buf();
    std::fs::create_dir_all(&containerd_root).unwrap();
    write_meta_db(&containerd_root);
    write_snapshot_db(&containerd_root);
    Fixture {
        _dir: dir,
        containerd_root,
        image_root,
    }
}

fn open(fixture: &Fixture) -> ContainerdExplorer {
    ContainerdExplorer::open(ContainerdOptions {
        image_root: fixture.image_root.clone(),
        containerd_root: fixture.containerd_root.clone(),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn namespaces_are_enumerated_in_order() {
    let fx = fixture();
    let explorer = open(&fx);
    assert_eq!(
        explorer.list_namespaces().unwrap(),
        vec!["default".to_string(), "k8s.io".to_string()]
    );
}

#[test]
fn containers_are_decoded_with_derived_fields() {
    let fx = fixture();
    let explorer = open(&fx);

    let containers = explorer.list_containers().unwrap();
    let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
    // Lexicographic within the namespace.
    assert_eq!(ids, vec!["base-only", "dangly", "loopy", "nginx-web"]);

    let web = containers.iter().find(|c| c.id == "nginx-web").unwrap();
    assert_eq!(web.namespace, "default");
    assert_eq!(web.image, "docker.io/library/nginx:latest");
    assert_eq!(web.image_base, "docker.io/library/nginx");
    assert_eq!(web.hostname, "web-host");
    assert_eq!(web.snapshotter, "overlayfs");
    assert_eq!(web.snapshot_key, "sha256:aaa");
    assert_eq!(web.runtime.as_deref(), Some("io.containerd.runc.v2"));
    assert_eq!(web.labels.get("app").map(String::as_str), Some("web"));
    assert!(!web.support_container);
    // No cgroup residue in this fixture.
    assert_eq!(web.status, TaskStatus::Unknown);
}

#[test]
fn runtime_state_is_reconstructed_from_cgroup_residue() {
    let fx = fixture();
    let cg = fx.image_root.join("sys/fs/cgroup/default/nginx-web");
    std::fs::create_dir_all(&cg).unwrap();
    std::fs::write(cg.join("cgroup.events"), "populated 1\nfrozen 0\n").unwrap();
    std::fs::write(cg.join("cgroup.procs"), "4321\n5000\n").unwrap();

    let explorer = open(&fx);
    let containers = explorer.list_containers().unwrap();
    let web = containers.iter().find(|c| c.id == "nginx-web").unwrap();
    assert_eq!(web.status, TaskStatus::Running);
    assert_eq!(web.process_id, Some(4321));

    let tasks = explorer.list_tasks().unwrap();
    let task = tasks.iter().find(|t| t.name == "nginx-web").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.pid, Some(4321));
}

#[test]
fn images_and_content_are_listed() {
    let fx = fixture();
    let explorer = open(&fx);

    let images = explorer.list_images().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].name, "docker.io/library/nginx:latest");
    assert_eq!(images[0].digest, "sha256:605c77e624dd");
    assert_eq!(images[0].size, 1862);
    assert!(!images[0].support_container_image);

    let content = explorer.list_content().unwrap();
    assert_eq!(content.len(), 1);
    assert_eq!(content[0].digest, "sha256:feedface01");
    assert_eq!(content[0].size, 4096);
    assert_eq!(
        content[0].labels.get("containerd.io/gc.root").map(String::as_str),
        Some("2023-03-01")
    );
}

#[test]
fn snapshots_merge_both_databases() {
    let fx = fixture();
    let explorer = open(&fx);

    let snapshots = explorer.list_snapshots().unwrap();
    let by_key = |key: &str| snapshots.iter().find(|s| s.key == key).unwrap();

    let aaa = by_key("sha256:aaa");
    assert_eq!(aaa.id, 42);
    assert_eq!(aaa.kind, SnapshotKind::Active);
    assert_eq!(aaa.parent, "sha256:bbb");
    assert_eq!(aaa.overlay_path, "snapshots/42/fs");
    assert_eq!(aaa.snapshotter, "overlayfs");

    let ccc = by_key("sha256:ccc");
    assert_eq!(ccc.id, 3);
    assert_eq!(ccc.kind, SnapshotKind::Committed);
    assert_eq!(ccc.parent, "");

    // Keys without a snapshotter-database entry still list (one-sided
    // presence).
    let dang = by_key("sha256:dang");
    assert_eq!(dang.id, 0);
    assert_eq!(dang.kind, SnapshotKind::Unknown);
}

#[test]
fn mount_composes_the_overlay_option_string() {
    let fx = fixture();
    let exec = RecordingExecutor::default();
    let explorer = open(&fx).with_executor(Box::new(exec.clone()));

    explorer
        .mount_container("nginx-web", Path::new("/tmp/analysis"))
        .unwrap();

    let snapshot_root = fx.containerd_root.join(SNAPSHOTTER_DIR);
    let expected_options = format!(
        "ro,lowerdir={0}/snapshots/42/fs:{0}/snapshots/17/fs:{0}/snapshots/3/fs",
        snapshot_root.display()
    );
    assert_eq!(
        exec.argv_log(),
        vec![vec![
            "mount".to_string(),
            "-t".to_string(),
            "overlay".to_string(),
            "overlay".to_string(),
            "-o".to_string(),
            expected_options.clone(),
            "/tmp/analysis".to_string(),
        ]]
    );

    // The option string leads with ro,lowerdir= and the first path is the
    // container's upperdir.
    assert!(expected_options.starts_with("ro,lowerdir="));
    let first = expected_options
        .trim_start_matches("ro,lowerdir=")
        .split(':')
        .next()
        .unwrap();
    assert!(first.ends_with("snapshots/42/fs"));
}

#[test]
fn chain_of_length_one_cannot_be_mounted() {
    let fx = fixture();
    let exec = RecordingExecutor::default();
    let explorer = open(&fx).with_executor(Box::new(exec.clone()));

    let err = explorer
        .mount_container("base-only", Path::new("/tmp/analysis"))
        .unwrap_err();
    assert!(matches!(err, ExplorerError::LowerdirEmpty(_)));
    assert!(exec.argv_log().is_empty());
}

#[test]
fn chain_cycles_and_dangling_parents_are_detected() {
    let fx = fixture();
    let explorer = open(&fx);

    let err = explorer
        .mount_container("loopy", Path::new("/tmp/x"))
        .unwrap_err();
    assert!(matches!(err, ExplorerError::ChainCycle(_)));

    let err = explorer
        .mount_container("dangly", Path::new("/tmp/x"))
        .unwrap_err();
    match err {
        ExplorerError::ChainDangling(key) => assert_eq!(key, "sha256:missing"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn missing_snapshot_database_degrades_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let containerd_root = dir.path().join("var/lib/containerd");
    std::fs::create_dir_all(&containerd_root).unwrap();
    write_meta_db(&containerd_root);
    // Note: no metadata.db. The snapshotter directory must still exist for
    // root discovery.
    std::fs::create_dir_all(containerd_root.join(SNAPSHOTTER_DIR)).unwrap();

    let explorer = ContainerdExplorer::open(ContainerdOptions {
        containerd_root: containerd_root.clone(),
        ..Default::default()
    })
    .unwrap();

    // Listing still works; snapshot-dependent fields are zero.
    let snapshots = explorer.list_snapshots().unwrap();
    assert!(snapshots.iter().all(|s| s.id == 0));

    // Mounting cannot.
    let err = explorer
        .mount_container("nginx-web", Path::new("/tmp/x"))
        .unwrap_err();
    assert!(matches!(err, ExplorerError::NoSnapshotDatabase));
}

#[test]
fn info_returns_spec_or_full_record() {
    let fx = fixture();
    let explorer = open(&fx);

    let spec = explorer.info_container("nginx-web", true).unwrap();
    assert_eq!(
        spec.get("hostname").and_then(|v| v.as_str()),
        Some("web-host")
    );

    let full = explorer.info_container("nginx-web", false).unwrap();
    assert_eq!(full.get("id").and_then(|v| v.as_str()), Some("nginx-web"));
    assert!(full.get("Spec").is_some());

    let err = explorer.info_container("missing", false).unwrap_err();
    assert!(matches!(err, ExplorerError::NotFound(_)));
}

#[test]
fn listings_are_deterministic() {
    let fx = fixture();
    let explorer = open(&fx);

    let first = serde_json::to_string(&explorer.list_containers().unwrap()).unwrap();
    let second = serde_json::to_string(&explorer.list_containers().unwrap()).unwrap();
    assert_eq!(first, second);

    let snapshots_a = serde_json::to_string(&explorer.list_snapshots().unwrap()).unwrap();
    let snapshots_b = serde_json::to_string(&explorer.list_snapshots().unwrap()).unwrap();
    assert_eq!(snapshots_a, snapshots_b);
}

#[test]
fn support_containers_are_classified_and_skipped() {
    let fx = fixture();
    let exec = RecordingExecutor::default();
    let mountpoint = tempfile::tempdir().unwrap();

    let policy = SupportContainerPolicy {
        images: vec!["docker.io/library/nginx".to_string()],
        ..Default::default()
    };
    let explorer = ContainerdExplorer::open(ContainerdOptions {
        containerd_root: fx.containerd_root.clone(),
        policy: Some(policy),
        ..Default::default()
    })
    .unwrap()
    .with_executor(Box::new(exec.clone()));

    let containers = explorer.list_containers().unwrap();
    let web = containers.iter().find(|c| c.id == "nginx-web").unwrap();
    assert!(web.support_container);

    // Only nginx-web carries app=web, and it is support-classified, so a
    // filtered skip-support mount-all mounts nothing.
    let filter = coldctr::mount::parse_label_filter("app=web");
    explorer
        .mount_all_containers(mountpoint.path(), &filter, true)
        .unwrap();
    assert!(exec.argv_log().is_empty());

    // With support containers allowed, the container mounts under
    // <mountpoint>/<id>.
    explorer
        .mount_all_containers(mountpoint.path(), &filter, false)
        .unwrap();
    let calls = exec.argv_log();
    assert_eq!(calls.len(), 1);
    assert!(calls[0]
        .last()
        .unwrap()
        .ends_with("nginx-web"));
}

#[test]
fn drift_reports_upperdir_changes() {
    let fx = fixture();
    let explorer = open(&fx);

    // Populate the resolved upperdir (snapshots/42/fs) with one change.
    let upper = fx
        .containerd_root
        .join(SNAPSHOTTER_DIR)
        .join("snapshots/42/fs");
    std::fs::create_dir_all(upper.join("etc")).unwrap();
    std::fs::write(upper.join("etc/motd"), b"intruded\n").unwrap();

    let drifts = explorer
        .container_drift(&Default::default(), true, Some("nginx-web"))
        .unwrap();
    assert_eq!(drifts.len(), 1);
    assert_eq!(drifts[0].container_id, "nginx-web");

    let added: Vec<&str> = drifts[0]
        .added_or_modified
        .iter()
        .map(|f| f.full_path.as_str())
        .collect();
    assert_eq!(added, vec!["/etc/motd"]);
    assert!(drifts[0].inaccessible_files.is_empty());
}

#[test]
#[ignore = "creates mountpoints under /mnt; requires root"]
fn export_produces_archive_via_shim() {
    let fx = fixture();
    let exec = RecordingExecutor::default();
    let out = tempfile::tempdir().unwrap();

    let explorer = open(&fx).with_executor(Box::new(exec.clone()));
    explorer
        .export_container(
            "nginx-web",
            out.path(),
            coldctr::ExportOptions {
                image: false,
                archive: true,
            },
        )
        .unwrap();

    let programs: Vec<String> = exec.argv_log().iter().map(|c| c[0].clone()).collect();
    assert_eq!(programs, vec!["mount", "tar", "umount"]);
}
