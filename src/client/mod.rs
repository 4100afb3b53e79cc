//! Cluster client interface
//!
//! The convergence core only talks to the cluster through [`ClusterClient`].
//! Production uses [`KubeClusterClient`]; tests substitute a mockall mock or
//! the in-memory fake cluster.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Error;

pub mod kube_client;

pub use kube_client::KubeClusterClient;

/// Taint key the node lifecycle controller sets while a node is not ready
pub const TAINT_NOT_READY: &str = "node.kubernetes.io/not-ready";
/// Taint key the node lifecycle controller sets while a node is unreachable
pub const TAINT_UNREACHABLE: &str = "node.kubernetes.io/unreachable";

/// Scheduling effect of a taint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaintEffect {
    /// New pods without a toleration are not scheduled
    NoSchedule,
    /// Running pods without a toleration are evicted
    NoExecute,
}

impl TaintEffect {
    /// Both effects, in removal order
    pub const ALL: [TaintEffect; 2] = [TaintEffect::NoSchedule, TaintEffect::NoExecute];

    /// Wire name as used in `spec.taints[].effect`
    pub fn as_str(self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a node, re-fetched every poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Whether the `Ready` condition has status `True`
    pub ready: bool,
    /// Keys of all taints currently on the node
    pub taint_keys: BTreeSet<String>,
}

impl NodeInfo {
    /// Build a node view from its name, readiness and taint keys
    pub fn new<I, S>(name: impl Into<String>, ready: bool, taint_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            ready,
            taint_keys: taint_keys.into_iter().map(Into::into).collect(),
        }
    }

    /// True if the node carries any taint key in `keys`
    pub fn has_any_taint(&self, keys: &[&str]) -> bool {
        keys.iter().any(|k| self.taint_keys.contains(*k))
    }
}

/// Point-in-time view of a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name
    pub name: String,
    /// Whether the `Ready` condition has status `True`
    pub ready: bool,
    /// Pod IP once one is assigned
    pub ip: Option<String>,
}

/// Replica counts of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeploymentStatus {
    /// Replicas reporting available
    pub available_replicas: i32,
    /// Replicas requested in the spec
    pub desired_replicas: i32,
}

impl DeploymentStatus {
    /// All desired replicas are available
    pub fn is_available(&self) -> bool {
        self.desired_replicas > 0 && self.available_replicas >= self.desired_replicas
    }
}

/// Kind of resource a wait targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// apps/v1 Deployment
    Deployment,
    /// v1 Pod
    Pod,
}

/// Which resources a wait applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// A single named resource
    Name(String),
    /// Every resource matching a label selector (at least one must exist)
    Labels(String),
}

/// Condition a wait blocks on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Deployment `Available` condition is `True`
    Available,
    /// Pod `Ready` condition is `True`
    Ready,
}

impl WaitCondition {
    /// Condition type name in resource status
    pub fn as_str(self) -> &'static str {
        match self {
            WaitCondition::Available => "Available",
            WaitCondition::Ready => "Ready",
        }
    }
}

/// A resource (or set of resources) and the condition to wait for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTarget {
    /// Resource kind
    pub kind: ResourceKind,
    /// Namespace to look in
    pub namespace: String,
    /// Which resources
    pub selector: Selector,
    /// Condition that must hold for every selected resource
    pub condition: WaitCondition,
}

impl WaitTarget {
    /// Wait for a named deployment to become available
    pub fn deployment_available(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Deployment,
            namespace: namespace.into(),
            selector: Selector::Name(name.into()),
            condition: WaitCondition::Available,
        }
    }

    /// Wait for a named pod to become ready
    pub fn pod_ready(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Pod,
            namespace: namespace.into(),
            selector: Selector::Name(name.into()),
            condition: WaitCondition::Ready,
        }
    }

    /// Wait for every pod matching a label selector to become ready
    pub fn pods_ready(namespace: impl Into<String>, labels: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Pod,
            namespace: namespace.into(),
            selector: Selector::Labels(labels.into()),
            condition: WaitCondition::Ready,
        }
    }
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ResourceKind::Deployment => "deployment",
            ResourceKind::Pod => "pod",
        };
        match &self.selector {
            Selector::Name(name) => write!(f, "{}/{}/{}", self.namespace, kind, name)?,
            Selector::Labels(labels) => write!(f, "{}/{}[{}]", self.namespace, kind, labels)?,
        }
        write!(f, " {}", self.condition.as_str())
    }
}

/// Where a manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Fetched over HTTP(S)
    Url(String),
    /// Read from the local filesystem
    Path(PathBuf),
}

impl ManifestSource {
    /// Interpret `location` as a URL if it has an http(s) scheme, else a path
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ManifestSource::Url(location.to_string())
        } else {
            ManifestSource::Path(PathBuf::from(location))
        }
    }
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestSource::Url(url) => f.write_str(url),
            ManifestSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Captured result of a command run inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Whether the command exited zero
    pub success: bool,
}

/// Type of a service exposing the sample workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    /// Cluster-internal virtual IP
    ClusterIp,
    /// Port opened on every node
    NodePort,
}

impl ServiceType {
    /// Wire name as used in `spec.type`
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::ClusterIp => "ClusterIP",
            ServiceType::NodePort => "NodePort",
        }
    }
}

/// Result of exposing a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposedService {
    /// Allocated node port, if the service type has one
    pub node_port: Option<u16>,
}

/// Operations the bootstrapper performs against the cluster control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all nodes with readiness and taint keys
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error>;

    /// Remove the taint `key:effect` from `node`. Absent taint is success.
    async fn remove_taint(&self, node: &str, key: &str, effect: TaintEffect) -> Result<(), Error>;

    /// Apply every document of a (possibly multi-document) manifest
    async fn apply_manifest(&self, source: &ManifestSource) -> Result<(), Error>;

    /// List pods in `namespace` matching a label selector
    async fn list_pods(&self, namespace: &str, labels: &str) -> Result<Vec<PodInfo>, Error>;

    /// Block until `target` holds or `timeout` elapses
    async fn wait_for_condition(&self, target: &WaitTarget, timeout: Duration)
        -> Result<(), Error>;

    /// Read replica counts of a deployment
    async fn get_deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, Error>;

    /// Start a single-container pod running `command`
    async fn run_pod(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        command: &[String],
    ) -> Result<(), Error>;

    /// Delete a pod. Absent pod is success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Run `command` in the pod's first container and capture its output
    async fn exec_in_pod(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, Error>;

    /// Create (or update) a deployment of `replicas` copies of `image`
    async fn create_deployment(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        replicas: i32,
        port: u16,
    ) -> Result<(), Error>;

    /// Expose a deployment through a service of the given type
    async fn expose_service(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
        service_type: ServiceType,
    ) -> Result<ExposedService, Error>;
}
