//! Bootstrap configuration
//!
//! Settings come from an optional YAML file and are then overridden by CLI
//! flags. Every field has a default, so an empty file (or none at all) gives
//! a one control-plane, two worker cluster running Calico. Durations are
//! whole seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cni::{manifest_location, CniConfig, DEFAULT_CNI_VERSION, DEFAULT_MANIFEST_TEMPLATE};
use crate::client::ManifestSource;
use crate::provision::ClusterSpec;
use crate::readiness::ReadinessConfig;
use crate::validation::ValidationConfig;
use crate::workload::WorkloadConfig;
use crate::Error;

/// Top-level configuration for a bootstrap run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapConfig {
    /// Cluster shape and lifecycle
    pub cluster: ClusterSettings,
    /// Network plugin to install
    pub cni: CniSettings,
    /// Node readiness timing
    pub readiness: ReadinessSettings,
    /// Post-convergence network checks
    pub validation: ValidationSettings,
    /// Sample workload
    pub workload: WorkloadSettings,
}

/// Cluster shape and lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// kind cluster name
    pub name: String,
    /// Control-plane node count
    pub control_planes: u32,
    /// Worker node count
    pub workers: u32,
    /// Replace an existing cluster with the same name
    pub recreate: bool,
    /// Kubeconfig path; kind's default location if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "kindling".to_string(),
            control_planes: 1,
            workers: 2,
            recreate: false,
            kubeconfig: None,
        }
    }
}

/// Network plugin to install and how long to wait for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CniSettings {
    /// Release substituted for `{version}` in `manifest`
    pub version: String,
    /// Manifest URL or path, optionally containing `{version}`
    pub manifest: String,
    /// Namespace the plugin runs in
    pub namespace: String,
    /// Controller deployment name
    pub controller_deployment: String,
    /// Label selector of the daemon pods
    pub daemon_selector: String,
    /// Pod CIDR
    pub pod_subnet: String,
    /// Seconds between daemon pod existence checks
    pub existence_poll_secs: u64,
    /// Seconds to wait for daemon pods to exist
    pub existence_timeout_secs: u64,
    /// Seconds for each availability wait
    pub availability_timeout_secs: u64,
}

impl Default for CniSettings {
    fn default() -> Self {
        let defaults = CniConfig::default();
        Self {
            version: DEFAULT_CNI_VERSION.to_string(),
            manifest: DEFAULT_MANIFEST_TEMPLATE.to_string(),
            namespace: defaults.namespace,
            controller_deployment: defaults.controller_deployment,
            daemon_selector: defaults.daemon_selector,
            pod_subnet: "192.168.0.0/16".to_string(),
            existence_poll_secs: defaults.existence_poll.as_secs(),
            existence_timeout_secs: defaults.existence_timeout.as_secs(),
            availability_timeout_secs: defaults.availability_timeout.as_secs(),
        }
    }
}

/// Node readiness timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessSettings {
    /// Overall budget
    pub timeout_secs: u64,
    /// Seconds between node samples
    pub poll_interval_secs: u64,
    /// Minimum seconds between remediation passes
    pub remediation_interval_secs: u64,
    /// Seconds to wait after a remediation pass that changed something
    pub settle_delay_secs: u64,
    /// Seconds to wait when no node has registered
    pub no_nodes_delay_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        let defaults = ReadinessConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            poll_interval_secs: defaults.poll_interval.as_secs(),
            remediation_interval_secs: defaults.remediation_interval.as_secs(),
            settle_delay_secs: defaults.settle_delay.as_secs(),
            no_nodes_delay_secs: defaults.no_nodes_delay.as_secs(),
        }
    }
}

/// Post-convergence network checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationSettings {
    /// Namespace of the diagnostic pod
    pub namespace: String,
    /// Diagnostic pod name
    pub pod_name: String,
    /// Diagnostic image
    pub image: String,
    /// Name that must resolve through cluster DNS
    pub dns_name: String,
    /// URL checked for outbound HTTP
    pub http_url: String,
    /// Address that must answer ping
    pub ping_address: String,
    /// Namespace of the pods pinged over the pod network
    pub peer_namespace: String,
    /// Label selector of the pods pinged over the pod network
    pub peer_selector: String,
    /// Seconds for the diagnostic pod to become ready
    pub pod_ready_timeout_secs: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        let defaults = ValidationConfig::default();
        Self {
            namespace: defaults.namespace,
            pod_name: defaults.pod_name,
            image: defaults.image,
            dns_name: defaults.dns_name,
            http_url: defaults.http_url,
            ping_address: defaults.ping_address,
            peer_namespace: defaults.peer_namespace,
            peer_selector: defaults.peer_selector,
            pod_ready_timeout_secs: defaults.pod_ready_timeout.as_secs(),
        }
    }
}

/// Sample workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkloadSettings {
    /// Namespace
    pub namespace: String,
    /// Deployment and service name
    pub name: String,
    /// Container image
    pub image: String,
    /// Replica count
    pub replicas: i32,
    /// Container and service port
    pub port: u16,
    /// Seconds for the deployment to become available
    pub ready_timeout_secs: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        let defaults = WorkloadConfig::default();
        Self {
            namespace: defaults.namespace,
            name: defaults.name,
            image: defaults.image,
            replicas: defaults.replicas,
            port: defaults.port,
            ready_timeout_secs: defaults.ready_timeout.as_secs(),
        }
    }
}

impl BootstrapConfig {
    /// Read a YAML config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse YAML content; an empty document yields the defaults
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Reject settings that can't produce a working run
    pub fn validate(&self) -> Result<(), Error> {
        let c = &self.cluster;
        require_non_empty("cluster.name", &c.name)?;
        if c.control_planes == 0 {
            return Err(Error::config("cluster.controlPlanes must be at least 1"));
        }

        let cni = &self.cni;
        require_non_empty("cni.version", &cni.version)?;
        require_non_empty("cni.manifest", &cni.manifest)?;
        require_non_empty("cni.namespace", &cni.namespace)?;
        require_non_empty("cni.controllerDeployment", &cni.controller_deployment)?;
        require_non_empty("cni.daemonSelector", &cni.daemon_selector)?;
        require_non_empty("cni.podSubnet", &cni.pod_subnet)?;
        require_positive("cni.existencePollSecs", cni.existence_poll_secs)?;
        require_positive("cni.availabilityTimeoutSecs", cni.availability_timeout_secs)?;
        require_at_least(
            "cni.existenceTimeoutSecs",
            cni.existence_timeout_secs,
            "cni.existencePollSecs",
            cni.existence_poll_secs,
        )?;

        let r = &self.readiness;
        require_positive("readiness.pollIntervalSecs", r.poll_interval_secs)?;
        require_positive("readiness.remediationIntervalSecs", r.remediation_interval_secs)?;
        require_positive("readiness.noNodesDelaySecs", r.no_nodes_delay_secs)?;
        require_at_least(
            "readiness.timeoutSecs",
            r.timeout_secs,
            "readiness.pollIntervalSecs",
            r.poll_interval_secs,
        )?;

        let v = &self.validation;
        require_non_empty("validation.podName", &v.pod_name)?;
        require_non_empty("validation.image", &v.image)?;
        require_non_empty("validation.dnsName", &v.dns_name)?;
        require_non_empty("validation.pingAddress", &v.ping_address)?;
        require_non_empty("validation.peerNamespace", &v.peer_namespace)?;
        require_non_empty("validation.peerSelector", &v.peer_selector)?;
        require_positive("validation.podReadyTimeoutSecs", v.pod_ready_timeout_secs)?;

        let w = &self.workload;
        require_non_empty("workload.name", &w.name)?;
        require_non_empty("workload.image", &w.image)?;
        if w.replicas < 1 {
            return Err(Error::config("workload.replicas must be at least 1"));
        }
        if w.port == 0 {
            return Err(Error::config("workload.port must be non-zero"));
        }

        Ok(())
    }

    /// Cluster to provision
    pub fn cluster_spec(&self) -> ClusterSpec {
        ClusterSpec {
            name: self.cluster.name.clone(),
            control_planes: self.cluster.control_planes,
            workers: self.cluster.workers,
            pod_subnet: self.cni.pod_subnet.clone(),
            recreate: self.cluster.recreate,
            kubeconfig: self.cluster.kubeconfig.clone(),
        }
    }

    /// CNI install plan
    pub fn cni_config(&self) -> CniConfig {
        let cni = &self.cni;
        CniConfig {
            manifest: ManifestSource::parse(&manifest_location(&cni.manifest, &cni.version)),
            namespace: cni.namespace.clone(),
            controller_deployment: cni.controller_deployment.clone(),
            daemon_selector: cni.daemon_selector.clone(),
            existence_poll: Duration::from_secs(cni.existence_poll_secs),
            existence_timeout: Duration::from_secs(cni.existence_timeout_secs),
            availability_timeout: Duration::from_secs(cni.availability_timeout_secs),
        }
    }

    /// Readiness poller timing
    pub fn readiness_config(&self) -> ReadinessConfig {
        let r = &self.readiness;
        ReadinessConfig {
            timeout: Duration::from_secs(r.timeout_secs),
            poll_interval: Duration::from_secs(r.poll_interval_secs),
            remediation_interval: Duration::from_secs(r.remediation_interval_secs),
            settle_delay: Duration::from_secs(r.settle_delay_secs),
            no_nodes_delay: Duration::from_secs(r.no_nodes_delay_secs),
        }
    }

    /// Network validator settings
    pub fn validation_config(&self) -> ValidationConfig {
        let v = &self.validation;
        ValidationConfig {
            namespace: v.namespace.clone(),
            pod_name: v.pod_name.clone(),
            image: v.image.clone(),
            dns_name: v.dns_name.clone(),
            http_url: v.http_url.clone(),
            ping_address: v.ping_address.clone(),
            peer_namespace: v.peer_namespace.clone(),
            peer_selector: v.peer_selector.clone(),
            pod_ready_timeout: Duration::from_secs(v.pod_ready_timeout_secs),
        }
    }

    /// Sample workload settings
    pub fn workload_config(&self) -> WorkloadConfig {
        let w = &self.workload;
        WorkloadConfig {
            namespace: w.namespace.clone(),
            name: w.name.clone(),
            image: w.image.clone(),
            replicas: w.replicas,
            port: w.port,
            ready_timeout: Duration::from_secs(w.ready_timeout_secs),
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::config(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_positive(field: &str, value: u64) -> Result<(), Error> {
    if value == 0 {
        return Err(Error::config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn require_at_least(field: &str, value: u64, other: &str, minimum: u64) -> Result<(), Error> {
    if value < minimum {
        return Err(Error::config(format!(
            "{field} ({value}) must not be shorter than {other} ({minimum})"
        )));
    }
    Ok(())
}
