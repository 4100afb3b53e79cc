//! [`ClusterClient`] backed by kube-rs
//!
//! All operations go straight to the API server; nothing shells out to
//! kubectl.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod, Service, Taint};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use super::{
    ClusterClient, DeploymentStatus, ExecOutput, ExposedService, ManifestSource, NodeInfo,
    PodInfo, ResourceKind, Selector, ServiceType, TaintEffect, WaitTarget,
};
use crate::clock::{Deadline, SystemClock};
use crate::manifest::{apply_documents, parse_manifests, FIELD_MANAGER};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Connection timeout for the API server (kind's API server is local)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for API calls
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between checks inside `wait_for_condition`
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Condition type/status accessors shared by node, pod and deployment conditions
trait HasConditionFields {
    fn type_field(&self) -> &str;
    fn status_field(&self) -> &str;
}

impl HasConditionFields for k8s_openapi::api::core::v1::NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::core::v1::PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for k8s_openapi::api::apps::v1::DeploymentCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// True if a condition of `condition_type` has status "True"
fn has_condition<T: HasConditionFields>(conditions: Option<&[T]>, condition_type: &str) -> bool {
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == "True")
        })
        .unwrap_or(false)
}

fn node_info(node: &Node) -> NodeInfo {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    let taint_keys = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().map(|t| t.key.clone()).collect())
        .unwrap_or_default();

    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        ready: has_condition(conditions, "Ready"),
        taint_keys,
    }
}

fn pod_ready(pod: &Pod) -> bool {
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref());
    has_condition(conditions, "Ready")
}

fn deployment_available(deployment: &Deployment) -> bool {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref());
    has_condition(conditions, "Available")
}

/// The taint list with every `key:effect` entry dropped, or `None` if the
/// node doesn't carry it. Other keys and the same key under the other
/// effect are kept as-is.
fn without_taint(taints: &[Taint], key: &str, effect: TaintEffect) -> Option<Vec<Taint>> {
    let remaining: Vec<Taint> = taints
        .iter()
        .filter(|t| !(t.key == key && t.effect == effect.as_str()))
        .cloned()
        .collect();
    (remaining.len() != taints.len()).then_some(remaining)
}

/// Error for a wait whose deadline ran out. A failing final check is
/// reported as such so RBAC or server errors don't read as a slow rollout.
fn expired_wait_error(
    target: &WaitTarget,
    last_counts: (usize, usize),
    last_error: Option<&Error>,
    elapsed: Duration,
) -> Error {
    match last_error {
        Some(e) => Error::dependency(
            "wait_for_condition",
            format!(
                "{} not met after {}s ({}/{} ready), last check failed: {}",
                target,
                elapsed.as_secs(),
                last_counts.0,
                last_counts.1,
                e
            ),
        ),
        None => Error::timeout(target.to_string(), last_counts.0, last_counts.1, elapsed),
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_string(&mut out).await {
            debug!(error = %e, "exec stream read ended early");
        }
    }
    out
}

/// Cluster client talking to a live API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig file (or the default chain) and an
    /// optional context name
    pub async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self, Error> {
        let kubeconfig = match kubeconfig {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| {
            Error::dependency("create_client", format!("failed to read kubeconfig: {}", e))
        })?;

        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let mut config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| {
                Error::dependency("create_client", format!("failed to load kubeconfig: {}", e))
            })?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

        let client = Client::try_from(config).map_err(|e| {
            Error::dependency("create_client", format!("failed to create client: {}", e))
        })?;

        Ok(Self::new(client))
    }

    /// The underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn fetch_manifest(source: &ManifestSource) -> Result<String, Error> {
        match source {
            ManifestSource::Url(url) => {
                let response = reqwest::get(url).await?.error_for_status()?;
                Ok(response.text().await?)
            }
            ManifestSource::Path(path) => Ok(tokio::fs::read_to_string(path).await?),
        }
    }

    /// One observation for a wait target: (ready, total)
    async fn observe(&self, target: &WaitTarget) -> Result<(usize, usize), Error> {
        match (target.kind, &target.selector) {
            (ResourceKind::Deployment, Selector::Name(name)) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                Ok(match api.get_opt(name).await? {
                    Some(d) => (usize::from(deployment_available(&d)), 1),
                    None => (0, 1),
                })
            }
            (ResourceKind::Deployment, Selector::Labels(labels)) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let list = api.list(&ListParams::default().labels(labels)).await?;
                let ready = list.items.iter().filter(|d| deployment_available(d)).count();
                Ok((ready, list.items.len()))
            }
            (ResourceKind::Pod, Selector::Name(name)) => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
                Ok(match api.get_opt(name).await? {
                    Some(p) => (usize::from(pod_ready(&p)), 1),
                    None => (0, 1),
                })
            }
            (ResourceKind::Pod, Selector::Labels(labels)) => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
                let list = api.list(&ListParams::default().labels(labels)).await?;
                let ready = list.items.iter().filter(|p| pod_ready(p)).count();
                Ok((ready, list.items.len()))
            }
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = retry_with_backoff(
            &RetryConfig::api_read(),
            "list_nodes",
            || {
                let api = api.clone();
                async move { api.list(&ListParams::default()).await }
            },
        )
        .await
        .map_err(|e| Error::dependency("list_nodes", e.to_string()))?;

        Ok(nodes.items.iter().map(node_info).collect())
    }

    async fn remove_taint(&self, node: &str, key: &str, effect: TaintEffect) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());

        retry_with_backoff(
            &RetryConfig::api_read(),
            "remove_taint",
            || {
                let api = api.clone();
                async move {
                    let Some(current) = api.get_opt(node).await? else {
                        trace!(node, "node gone, nothing to untaint");
                        return Ok::<(), Error>(());
                    };

                    let taints = current
                        .spec
                        .as_ref()
                        .and_then(|s| s.taints.as_deref())
                        .unwrap_or_default();
                    let Some(remaining) = without_taint(taints, key, effect) else {
                        trace!(node, key, %effect, "taint already absent");
                        return Ok(());
                    };

                    // Merge patch replaces the whole list; resourceVersion
                    // turns a concurrent node update into a 409 instead of a lost write.
                    let patch = json!({
                        "metadata": { "resourceVersion": current.metadata.resource_version },
                        "spec": { "taints": remaining },
                    });
                    api.patch(node, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    debug!(node, key, %effect, "removed taint");
                    Ok(())
                }
            },
        )
        .await
    }

    async fn apply_manifest(&self, source: &ManifestSource) -> Result<(), Error> {
        info!(source = %source, "applying manifest");
        let content = Self::fetch_manifest(source).await?;
        let docs = parse_manifests(&content)?;
        debug!(documents = docs.len(), "parsed manifest");
        apply_documents(&self.client, &docs).await
    }

    async fn list_pods(&self, namespace: &str, labels: &str) -> Result<Vec<PodInfo>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(labels)).await?;
        Ok(pods
            .items
            .iter()
            .map(|p| PodInfo {
                name: p.metadata.name.clone().unwrap_or_default(),
                ready: pod_ready(p),
                ip: p.status.as_ref().and_then(|s| s.pod_ip.clone()),
            })
            .collect())
    }

    async fn wait_for_condition(
        &self,
        target: &WaitTarget,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = Deadline::start(Arc::new(SystemClock), timeout);
        let mut last_counts = (0, 0);
        let mut last_error = None;

        loop {
            match self.observe(target).await {
                Ok((ready, total)) => {
                    last_counts = (ready, total);
                    last_error = None;
                    if total > 0 && ready == total {
                        debug!(target = %target, ready, total, "condition met");
                        return Ok(());
                    }
                    trace!(target = %target, ready, total, "condition not met yet");
                }
                Err(e) => {
                    warn!(target = %target, error = %e, "continuing despite failed wait check");
                    last_error = Some(e);
                }
            }

            if deadline.expired() {
                return Err(expired_wait_error(
                    target,
                    last_counts,
                    last_error.as_ref(),
                    deadline.elapsed(),
                ));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline.remaining())).await;
        }
    }

    async fn get_deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentStatus, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api.get(name).await?;
        Ok(DeploymentStatus {
            available_replicas: deployment
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            desired_replicas: deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
        })
    }

    async fn run_pod(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        command: &[String],
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { "app.kubernetes.io/managed-by": FIELD_MANAGER },
            },
            "spec": {
                "restartPolicy": "Never",
                "terminationGracePeriodSeconds": 0,
                "containers": [{
                    "name": name,
                    "image": image,
                    "command": command,
                }],
            },
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&pod))
            .await?;
        debug!(namespace, pod = name, image, "pod started");
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default().stdout(true).stderr(true);

        let mut attached = api.exec(name, command.to_vec(), &params).await?;
        let status = attached.take_status();
        let (stdout, stderr) = (attached.stdout(), attached.stderr());
        let (stdout, stderr) = tokio::join!(read_to_string(stdout), read_to_string(stderr));

        let success = match status {
            Some(status) => status
                .await
                .and_then(|s| serde_json::to_value(&s).ok())
                .is_some_and(|s| s["status"] == "Success"),
            None => false,
        };

        if let Err(e) = attached.join().await {
            debug!(pod = name, error = %e, "exec session closed with error");
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        replicas: i32,
        port: u16,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { "app": name, "app.kubernetes.io/managed-by": FIELD_MANAGER },
            },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "app": name } },
                "template": {
                    "metadata": { "labels": { "app": name } },
                    "spec": {
                        "containers": [{
                            "name": name,
                            "image": image,
                            "ports": [{ "containerPort": port }],
                        }],
                    },
                },
            },
        });
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&deployment),
        )
        .await?;
        Ok(())
    }

    async fn expose_service(
        &self,
        namespace: &str,
        name: &str,
        port: u16,
        service_type: ServiceType,
    ) -> Result<ExposedService, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": { "app": name, "app.kubernetes.io/managed-by": FIELD_MANAGER },
            },
            "spec": {
                "type": service_type.as_str(),
                "selector": { "app": name },
                "ports": [{ "port": port, "targetPort": port, "protocol": "TCP" }],
            },
        });
        let applied = api
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&service),
            )
            .await?;

        let node_port = applied
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.first())
            .and_then(|p| p.node_port)
            .and_then(|p| u16::try_from(p).ok());

        Ok(ExposedService { node_port })
    }
}
