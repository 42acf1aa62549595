//! Support-container classification.
//!
//! Kubernetes nodes run a fleet of infrastructure containers (kube-proxy,
//! DNS, CSI drivers, log shippers) that investigators usually want to skip.
//! The policy is three lists of match strings loaded from a YAML file:
//!
//! ```yaml
//! images:
//!   - gke.gcr.io/fluent-bit
//! names:
//!   - kube-proxy
//! labels:
//!   - io.kubernetes.pod.namespace=kube-system
//! ```
//!
//! Image and name entries match as case-insensitive substrings; label
//! entries match a formatted `key=value` pair case-insensitively. No policy
//! means nothing is classified as a support container.

use std::path::Path;

use serde::Deserialize;

use crate::container::Container;
use crate::error::{ExplorerError, Result};

/// Match rules for identifying Kubernetes infrastructure containers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupportContainerPolicy {
    /// Image basename substrings.
    #[serde(default)]
    pub images: Vec<String>,
    /// Hostname substrings.
    #[serde(default)]
    pub names: Vec<String>,
    /// `key=value` label pairs, matched exactly (case-insensitive).
    #[serde(default)]
    pub labels: Vec<String>,
}

impl SupportContainerPolicy {
    /// Load a policy from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SupportContainerPolicy> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ExplorerError::io(path, e))?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Built-in image list for GKE node plumbing, usable when no policy
    /// file is given on the command line.
    pub fn gke_defaults() -> SupportContainerPolicy {
        let images = [
            "asia.gcr.io/gke-release-staging/cluster-proportional-autoscaler-amd64",
            "gcr.io/k8s-ingress-image-push/ingress-gce-404-server-with-metrics",
            "gke.gcr.io/cluster-proportional-autoscaler",
            "gke.gcr.io/csi-node-driver-registrar",
            "gke.gcr.io/event-exporter",
            "gke.gcr.io/fluent-bit",
            "gke.gcr.io/fluent-bit-gke-exporter",
            "gke.gcr.io/gcp-compute-persistent-disk-csi-driver",
            "gke.gcr.io/gke-metrics-agent",
            "gke.gcr.io/k8s-dns-dnsmasq-nanny",
            "gke.gcr.io/k8s-dns-kube-dns",
            "gke.gcr.io/k8s-dns-sidecar",
            "gke.gcr.io/kube-proxy-amd64",
            "gke.gcr.io/prometheus-to-sd",
            "gke.gcr.io/proxy-agent",
            "k8s.gcr.io/metrics-server/metrics-server",
            "k8s.gcr.io/pause",
        ];
        SupportContainerPolicy {
            images: images.iter().map(|s| s.to_string()).collect(),
            names: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// True when the image basename matches a configured image substring.
    pub fn matches_image(&self, image_base: &str) -> bool {
        let image_base = image_base.to_lowercase();
        self.images
            .iter()
            .any(|m| image_base.contains(&m.to_lowercase()))
    }

    /// True when the container matches any image, hostname, or label rule.
    pub fn matches_container(&self, container: &Container) -> bool {
        if self.matches_image(&container.image_base) {
            return true;
        }

        let hostname = container.hostname.to_lowercase();
        if !hostname.is_empty()
            && self
                .names
                .iter()
                .any(|m| hostname.contains(&m.to_lowercase()))
        {
            return true;
        }

        for (k, v) in &container.labels {
            let pair = format!("{k}={v}");
            if self.labels.iter().any(|m| m.eq_ignore_ascii_case(&pair)) {
                return true;
            }
        }

        false
    }
}

/// Classify a container against an optional policy. `None` classifies
/// nothing.
pub fn is_support_container(
    policy: Option<&SupportContainerPolicy>,
    container: &Container,
) -> bool {
    policy.is_some_and(|p| p.matches_container(container))
}

/// Classify an image basename against an optional policy.
pub fn is_support_image(policy: Option<&SupportContainerPolicy>, image_base: &str) -> bool {
    policy.is_some_and(|p| p.matches_image(image_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{image_basename, ContainerType};
    use crate::runtime::TaskStatus;
    use std::collections::BTreeMap;

    fn container(image: &str, hostname: &str, labels: &[(&str, &str)]) -> Container {
        Container {
            namespace: "default".into(),
            id: "c1".into(),
            image_base: image_basename(image),
            image: image.into(),
            hostname: hostname.into(),
            snapshotter: "overlayfs".into(),
            snapshot_key: String::new(),
            runtime: None,
            created_at: None,
            updated_at: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
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
    fn substring_match_on_image_basename() {
        let policy = SupportContainerPolicy {
            images: vec!["gke.gcr.io/fluent-bit".into()],
            ..Default::default()
        };
        // Basename of the exporter image still contains the fluent-bit
        // entry as a substring.
        let c = container("gke.gcr.io/fluent-bit-gke-exporter:1.2", "", &[]);
        assert!(policy.matches_container(&c));

        let c = container("docker.io/library/nginx:latest", "", &[]);
        assert!(!policy.matches_container(&c));
    }

    #[test]
    fn hostname_and_label_rules() {
        let policy = SupportContainerPolicy {
            names: vec!["kube-proxy".into()],
            labels: vec!["io.kubernetes.pod.namespace=kube-system".into()],
            ..Default::default()
        };

        assert!(policy.matches_container(&container("app:1", "KUBE-PROXY-node1", &[])));
        assert!(policy.matches_container(&container(
            "app:1",
            "web",
            &[("io.kubernetes.pod.namespace", "kube-system")]
        )));
        assert!(!policy.matches_container(&container("app:1", "web", &[])));
    }

    #[test]
    fn no_policy_classifies_nothing() {
        let c = container("gke.gcr.io/fluent-bit:1.2", "kube-proxy", &[]);
        assert!(!is_support_container(None, &c));
        assert!(!is_support_image(None, "gke.gcr.io/fluent-bit"));
    }

    #[test]
    fn yaml_policy_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("support.yaml");
        std::fs::write(
            &path,
            "images:\n  - k8s.gcr.io/pause\nnames:\n  - coredns\n",
        )
        .unwrap();

        let policy = SupportContainerPolicy::load(&path).unwrap();
        assert!(policy.matches_image("k8s.gcr.io/pause"));
        assert!(policy.labels.is_empty());
    }
}
