//! Container records and the fields derived from them.
//!
//! A [`Container`] is the merged view an investigator sees: the raw record
//! decoded from the manifest database (or from Docker's `config.v2.json`)
//! plus derived fields such as the hostname, the image basename and the
//! reconstructed runtime state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kvdb::Bucket;
use crate::runtime::TaskStatus;
use crate::schema;

/// Which backend a container record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Containerd,
    Docker,
}

impl std::fmt::Display for ContainerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerType::Containerd => f.write_str("containerd"),
            ContainerType::Docker => f.write_str("docker"),
        }
    }
}

/// The container's OCI runtime spec as stored on disk: a protobuf `Any`
/// whose value is JSON. Decoded lazily; most operations never need it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpecBlob {
    /// Type URL from the `Any` wrapper.
    pub type_url: String,
    /// Raw JSON bytes of the spec.
    #[serde(skip)]
    pub value: Vec<u8>,
}

impl SpecBlob {
    /// Decode the raw spec bytes stored in a container bucket.
    pub fn from_bucket(bucket: &Bucket<'_>) -> Option<SpecBlob> {
        let raw = bucket.get(schema::KEY_SPEC)?;
        let (type_url, value) = schema::decode_any(raw)?;
        Some(SpecBlob { type_url, value })
    }

    /// The spec as an untyped JSON document.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.value).ok()
    }

    /// The spec narrowed to the fields the explorer consumes.
    pub fn runtime_spec(&self) -> RuntimeSpec {
        serde_json::from_slice(&self.value).unwrap_or_default()
    }
}

/// Minimal typed view of the OCI runtime spec: only the fields used for
/// hostname derivation and cgroup path computation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSpec {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessSpec>,
    #[serde(default)]
    pub linux: Option<LinuxSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinuxSpec {
    #[serde(default, rename = "cgroupsPath")]
    pub cgroups_path: Option<String>,
}

/// A container as reconstructed from on-disk metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    pub namespace: String,
    pub id: String,
    /// Image reference, e.g. `docker.io/library/nginx:latest`.
    pub image: String,
    /// Image reference with any `@digest` and `:tag` suffixes stripped.
    pub image_base: String,
    pub hostname: String,
    pub snapshotter: String,
    pub snapshot_key: String,
    /// Runtime name, e.g. `io.containerd.runc.v2`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    /// Raw runtime spec; not serialized, fetched via `info`.
    #[serde(skip)]
    pub spec: Option<SpecBlob>,
    /// True when the support-container policy classified this container as
    /// Kubernetes infrastructure plumbing.
    pub support_container: bool,
    pub container_type: ContainerType,
    /// Init process id recovered from the captured image, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i64>,
    pub status: TaskStatus,
    /// Docker-only: the `Running` flag from config.v2.json.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub running: bool,
    /// Docker-only: exposed ports from the container config.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exposed_ports: Vec<String>,
}

impl Container {
    /// Decode a container record from its manifest-database bucket.
    pub fn from_bucket(namespace: &str, id: &str, bucket: &Bucket<'_>) -> Container {
        let (created_at, updated_at) = schema::read_timestamps(bucket);
        let labels = schema::read_labels(bucket);
        let image = bucket.get_str(schema::KEY_IMAGE).unwrap_or_default();
        let spec = SpecBlob::from_bucket(bucket);
        let runtime = bucket
            .bucket(schema::KEY_RUNTIME)
            .and_then(|b| b.get_str(schema::KEY_NAME));

        let hostname = derive_hostname(&labels, spec.as_ref());

        Container {
            namespace: namespace.to_string(),
            id: id.to_string(),
            image_base: image_basename(&image),
            image,
            hostname,
            snapshotter: bucket.get_str(schema::KEY_SNAPSHOTTER).unwrap_or_default(),
            snapshot_key: bucket.get_str(schema::KEY_SNAPSHOT_KEY).unwrap_or_default(),
            runtime,
            created_at,
            updated_at,
            labels,
            spec,
            support_container: false,
            container_type: ContainerType::Containerd,
            process_id: None,
            status: TaskStatus::Unknown,
            running: false,
            exposed_ports: Vec::new(),
        }
    }

    /// The `linux.cgroupsPath` of the runtime spec, when present.
    pub fn cgroups_path(&self) -> Option<String> {
        self.spec
            .as_ref()
            .map(|s| s.runtime_spec())
            .and_then(|s| s.linux)
            .and_then(|l| l.cgroups_path)
    }
}

/// Derive a display hostname for a container.
///
/// Tried in order, first non-empty wins: the `io.kubernetes.pod.name`
/// label, the spec's `hostname` field, then a `HOSTNAME=` entry in the
/// spec's process environment.
pub fn derive_hostname(labels: &BTreeMap<String, String>, spec: Option<&SpecBlob>) -> String {
    if let Some(name) = labels.get("io.kubernetes.pod.name") {
        if !name.is_empty() {
            return name.clone();
        }
    }

    let Some(spec) = spec else {
        return String::new();
    };
    let rspec = spec.runtime_spec();

    if let Some(hostname) = rspec.hostname {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    if let Some(env) = rspec.process.and_then(|p| p.env) {
        for kv in env {
            if let Some(value) = kv.strip_prefix("HOSTNAME=") {
                return value.trim().to_string();
            }
        }
    }

    String::new()
}

/// Strip any `@digest` and `:tag` suffixes from an image reference so it
/// can be matched against support-container policy entries.
pub fn image_basename(image: &str) -> String {
    let mut base = image;
    if let Some(at) = base.find('@') {
        base = &base[..at];
    }
    if let Some(colon) = base.rfind(':') {
        // A colon after the last slash separates the tag; one before it is a
        // registry port.
        let last_slash = base.rfind('/').map_or(0, |i| i + 1);
        if colon >= last_slash {
            base = &base[..colon];
        }
    }
    base.to_string()
}
