//! End-to-end tests for the Docker backend over a fabricated docker root.

mod common;

use std::path::{Path, PathBuf};

use common::RecordingExecutor;

use coldctr::{
    ContainerExplorer, DockerExplorer, DockerOptions, ExplorerError, TaskStatus,
};

const CONTAINER_ID: &str = "8ba1e788e5d13c3a";
const MOUNT_ID: &str = "f00dfeed2a6b";

struct Fixture {
    _dir: tempfile::TempDir,
    docker_root: PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let docker_root = dir.path().join("var/lib/docker");

    // Container record.
    let ctr_dir = docker_root.join("containers").join(CONTAINER_ID);
    std::fs::create_dir_all(&ctr_dir).unwrap();
    std::fs::write(
        ctr_dir.join("config.v2.json"),
        format!(
            r#"{{
                "ID": "{CONTAINER_ID}",
                "Created": "2023-05-01T09:59:00Z",
                "State": {{"Running": true, "Paused": false, "Pid": 2468,
                           "StartedAt": "2023-05-01T10:00:00Z"}},
                "Config": {{
                    "Hostname": "web-1",
                    "Image": "nginx:latest",
                    "Labels": {{"app": "web"}},
                    "ExposedPorts": {{"80/tcp": {{}}, "443/tcp": {{}}}}
                }},
                "Image": "sha256:605c77e624dd",
                "Name": "/web",
                "Driver": "overlay2"
            }}"#
        ),
    )
    .unwrap();

    // Repository map: the same digest under a tag name and a digest-pinned
    // alias.
    let image_dir = docker_root.join("image/overlay2");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::write(
        image_dir.join("repositories.json"),
        r#"{"Repositories":{"nginx":{
            "nginx:latest":"sha256:605c77e624dd",
            "nginx@sha256:0d17b565c37b":"sha256:605c77e624dd"
        }}}"#,
    )
    .unwrap();

    // Image content record for the creation time.
    let content_dir = image_dir.join("imagedb/content/sha256");
    std::fs::create_dir_all(&content_dir).unwrap();
    std::fs::write(
        content_dir.join("605c77e624dd"),
        r#"{"architecture":"amd64","os":"linux","created":"2021-12-29T19:28:29Z"}"#,
    )
    .unwrap();

    // Overlay mount indirection and directories.
    let mounts_dir = image_dir.join("layerdb/mounts").join(CONTAINER_ID);
    std::fs::create_dir_all(&mounts_dir).unwrap();
    std::fs::write(mounts_dir.join("mount-id"), MOUNT_ID).unwrap();

    let mount_dir = docker_root.join("overlay2").join(MOUNT_ID);
    std::fs::create_dir_all(mount_dir.join("diff/etc")).unwrap();
    std::fs::create_dir_all(mount_dir.join("work")).unwrap();
    std::fs::write(mount_dir.join("lower"), "l/AAAA:l/BBBB").unwrap();
    std::fs::write(mount_dir.join("diff/etc/shadow"), b"tampered\n").unwrap();

    Fixture {
        _dir: dir,
        docker_root,
    }
}

fn open(fx: &Fixture) -> DockerExplorer {
    DockerExplorer::open(DockerOptions {
        docker_root: fx.docker_root.clone(),
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn missing_docker_root_is_input_missing() {
    let err = DockerExplorer::open(DockerOptions {
        docker_root: PathBuf::from("/nonexistent/var/lib/docker"),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ExplorerError::InputMissing(_)));
}

#[test]
fn namespaces_default_without_containerd() {
    let fx = fixture();
    let explorer = open(&fx);
    assert_eq!(explorer.list_namespaces().unwrap(), vec!["default"]);
}

#[test]
fn containers_use_friendly_image_names() {
    let fx = fixture();
    let explorer = open(&fx);

    let containers = explorer.list_containers().unwrap();
    assert_eq!(containers.len(), 1);
    let c = &containers[0];

    assert_eq!(c.id, CONTAINER_ID);
    // The digest resolved through repositories.json, preferring the tag
    // over the digest-pinned alias.
    assert_eq!(c.image, "nginx:latest");
    assert_eq!(c.image_base, "nginx");
    assert_eq!(c.hostname, "web-1");
    assert_eq!(c.status, TaskStatus::Running);
    assert_eq!(c.process_id, Some(2468));
    assert!(c.running);
    assert_eq!(c.exposed_ports, vec!["443/tcp", "80/tcp"]);
    assert_eq!(c.snapshotter, "overlay2");
    assert_eq!(c.labels.get("app").map(String::as_str), Some("web"));
}

#[test]
fn images_carry_creation_time_from_content_records() {
    let fx = fixture();
    let explorer = open(&fx);

    let images = explorer.list_images().unwrap();
    // One record per reference, including the digest-pinned alias.
    assert_eq!(images.len(), 2);

    let tagged = images.iter().find(|i| i.name == "nginx:latest").unwrap();
    assert_eq!(tagged.digest, "sha256:605c77e624dd");
    assert_eq!(
        tagged.created_at.map(|t| t.to_rfc3339()),
        Some("2021-12-29T19:28:29+00:00".to_string())
    );
}

#[test]
fn mount_resolves_the_layerdb_indirection() {
    let fx = fixture();
    let exec = RecordingExecutor::default();
    let explorer = open(&fx).with_executor(Box::new(exec.clone()));

    explorer
        .mount_container(CONTAINER_ID, Path::new("/tmp/analysis"))
        .unwrap();

    let overlay = fx.docker_root.join("overlay2");
    let expected_options = format!(
        "ro,lowerdir={mnt}/diff:{ov}/l/AAAA:{ov}/l/BBBB",
        mnt = overlay.join(MOUNT_ID).display(),
        ov = overlay.display(),
    );
    assert_eq!(
        exec.argv_log(),
        vec![vec![
            "mount".to_string(),
            "-t".to_string(),
            "overlay".to_string(),
            "overlay".to_string(),
            "-o".to_string(),
            expected_options,
            "/tmp/analysis".to_string(),
        ]]
    );
}

#[test]
fn drift_walks_the_diff_directory() {
    let fx = fixture();
    let explorer = open(&fx);

    let drifts = explorer
        .container_drift(&Default::default(), true, Some(CONTAINER_ID))
        .unwrap();
    assert_eq!(drifts.len(), 1);

    let added: Vec<&str> = drifts[0]
        .added_or_modified
        .iter()
        .map(|f| f.full_path.as_str())
        .collect();
    assert_eq!(added, vec!["/etc/shadow"]);
    assert!(drifts[0].added_or_modified[0].file_sha256.is_some());
}

#[test]
fn tasks_derive_from_config_state() {
    let fx = fixture();
    let explorer = open(&fx);

    let tasks = explorer.list_tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, CONTAINER_ID);
    assert_eq!(tasks[0].status, TaskStatus::Running);
    assert_eq!(tasks[0].pid, Some(2468));
}

#[test]
fn info_returns_the_raw_config_document() {
    let fx = fixture();
    let explorer = open(&fx);

    let full = explorer.info_container(CONTAINER_ID, false).unwrap();
    assert_eq!(
        full.get("Driver").and_then(|v| v.as_str()),
        Some("overlay2")
    );

    let spec = explorer.info_container(CONTAINER_ID, true).unwrap();
    assert_eq!(
        spec.get("Hostname").and_then(|v| v.as_str()),
        Some("web-1")
    );

    let err = explorer.info_container("missing", false).unwrap_err();
    assert!(matches!(err, ExplorerError::NotFound(_)));
}

#[test]
fn snapshots_and_content_are_empty_for_docker() {
    let fx = fixture();
    let explorer = open(&fx);
    assert!(explorer.list_snapshots().unwrap().is_empty());
    assert!(explorer.list_content().unwrap().is_empty());
    assert_eq!(explorer.snapshot_root("overlayfs"), "unknown");
}
