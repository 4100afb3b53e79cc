//! Prerequisite checks and kind cluster provisioning
//!
//! Everything here shells out to host tools. The orchestrator only sees the
//! [`Prerequisites`] and [`ClusterProvisioner`] traits so bootstrap sequencing
//! can be tested without docker.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::client::{ClusterClient, KubeClusterClient};
use crate::Error;

/// Shape of the cluster to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// kind cluster name
    pub name: String,
    /// Number of control-plane nodes (at least one)
    pub control_planes: u32,
    /// Number of worker nodes
    pub workers: u32,
    /// Pod CIDR handed to the CNI
    pub pod_subnet: String,
    /// Delete an existing cluster with the same name first
    pub recreate: bool,
    /// Kubeconfig file to write and read; the default location if unset
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterSpec {
    /// kubeconfig context kind creates for this cluster
    pub fn context(&self) -> String {
        format!("kind-{}", self.name)
    }
}

/// Checks that the host has the tools bootstrap needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prerequisites: Send + Sync {
    /// Fail with the first missing tool
    async fn check(&self) -> Result<(), Error>;
}

/// Creates a cluster and hands back a client bound to it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create the cluster and export its kubeconfig
    async fn create(&self, spec: &ClusterSpec) -> Result<(), Error>;

    /// Build a client against the cluster's context
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn ClusterClient>, Error>;
}

/// Host tools required by kind provisioning, with install hints
pub const REQUIRED_TOOLS: [(&str, &str); 2] = [
    ("docker", "Install Docker: https://docs.docker.com/get-docker/"),
    (
        "kind",
        "Install kind: https://kind.sigs.k8s.io/docs/user/quick-start/#installation",
    ),
];

/// [`Prerequisites`] that looks tools up on `PATH` with `which`
#[derive(Debug, Clone, Default)]
pub struct ToolCheck;

#[async_trait]
impl Prerequisites for ToolCheck {
    async fn check(&self) -> Result<(), Error> {
        for (tool, hint) in REQUIRED_TOOLS {
            let found = Command::new("which").arg(tool).output().await?.status.success();
            if !found {
                return Err(Error::dependency(
                    "prerequisites",
                    format!("{tool} not found on PATH - {hint}"),
                ));
            }
            debug!(tool, "found");
        }
        info!("prerequisites present");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindConfig {
    kind: &'static str,
    api_version: &'static str,
    networking: KindNetworking,
    nodes: Vec<KindNode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindNetworking {
    #[serde(rename = "disableDefaultCNI")]
    disable_default_cni: bool,
    pod_subnet: String,
}

#[derive(Debug, Serialize)]
struct KindNode {
    role: &'static str,
}

/// Render the kind `Cluster` config for `spec`
///
/// The default CNI is always disabled; the bootstrapper installs its own.
pub fn kind_config(spec: &ClusterSpec) -> Result<String, Error> {
    let nodes = std::iter::repeat_with(|| KindNode {
        role: "control-plane",
    })
    .take(spec.control_planes as usize)
    .chain(std::iter::repeat_with(|| KindNode { role: "worker" }).take(spec.workers as usize))
    .collect();

    let config = KindConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        networking: KindNetworking {
            disable_default_cni: true,
            pod_subnet: spec.pod_subnet.clone(),
        },
        nodes,
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// [`ClusterProvisioner`] backed by the `kind` CLI
#[derive(Debug, Clone, Default)]
pub struct KindProvisioner;

impl KindProvisioner {
    async fn cluster_exists(&self, name: &str) -> Result<bool, Error> {
        let clusters = run_command("kind", &["get", "clusters"]).await?;
        Ok(clusters.lines().any(|line| line.trim() == name))
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        info!(cluster = %name, "deleting existing cluster");
        run_command("kind", &["delete", "cluster", "--name", name]).await?;
        Ok(())
    }

    async fn export_kubeconfig(&self, spec: &ClusterSpec) -> Result<(), Error> {
        let path = spec
            .kubeconfig
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        let mut args = vec!["export", "kubeconfig", "--name", spec.name.as_str()];
        if let Some(path) = &path {
            args.extend(["--kubeconfig", path.as_str()]);
        }
        run_command("kind", &args).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterProvisioner for KindProvisioner {
    async fn create(&self, spec: &ClusterSpec) -> Result<(), Error> {
        if self.cluster_exists(&spec.name).await? {
            if !spec.recreate {
                return Err(Error::dependency(
                    "kind",
                    format!(
                        "cluster '{}' already exists (use --recreate to replace it)",
                        spec.name
                    ),
                ));
            }
            self.delete(&spec.name).await?;
        }

        let config = kind_config(spec)?;
        info!(
            cluster = %spec.name,
            control_planes = spec.control_planes,
            workers = spec.workers,
            "creating kind cluster"
        );

        let mut command = Command::new("kind");
        command
            .args(["create", "cluster", "--name", spec.name.as_str(), "--config", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(kubeconfig) = &spec.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        let mut child = command.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(config.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::command_failed(format!(
                "kind create cluster: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.export_kubeconfig(spec).await?;
        info!(cluster = %spec.name, context = %spec.context(), "cluster created");
        Ok(())
    }

    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn ClusterClient>, Error> {
        let context = spec.context();
        let client =
            KubeClusterClient::connect(spec.kubeconfig.as_deref(), Some(context.as_str())).await?;
        debug!(context = %context, "switched to cluster context");
        Ok(Arc::new(client))
    }
}

/// Run a command and return stdout
async fn run_command(cmd: &str, args: &[&str]) -> Result<String, Error> {
    let output = Command::new(cmd).args(args).output().await?;

    if !output.status.success() {
        return Err(Error::command_failed(format!(
            "{} {}: {}",
            cmd,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
