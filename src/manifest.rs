//! Manifest parsing, ordering and server-side apply
//!
//! Upstream CNI manifests are multi-document YAML mixing CRDs, RBAC and
//! workloads. Documents are split, ordered so foundational kinds land first,
//! resolved through API discovery and applied with server-side apply.

use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "kindling";

/// Namespace used for namespaced documents that don't name one
const DEFAULT_NAMESPACE: &str = "default";

/// One parsed manifest document
#[derive(Debug, Clone)]
pub struct ManifestDoc {
    /// Full object as JSON
    pub value: serde_json::Value,
    /// Parsed group/version/kind
    pub gvk: GroupVersionKind,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if set
    pub namespace: Option<String>,
}

impl ManifestDoc {
    fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::dependency("parse_manifest", "manifest missing apiVersion"))?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::dependency("parse_manifest", "manifest missing kind"))?;
        let name = value
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::dependency("parse_manifest", "manifest missing metadata.name"))?
            .to_string();
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        };

        Ok(Self {
            value,
            gvk,
            name,
            namespace,
        })
    }

    /// Resource kind
    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }
}

/// Split apiVersion into (group, version); core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Apply order for a kind (lower first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "PodDisruptionBudget" | "PriorityClass" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        _ => 9,
    }
}

/// Parse a multi-document YAML (or single JSON) manifest into ordered documents.
///
/// Empty and comment-only documents are skipped. The result is
/// stable-sorted by [`kind_priority`].
pub fn parse_manifests(content: &str) -> Result<Vec<ManifestDoc>, Error> {
    let mut docs = Vec::new();

    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if !value.is_object() {
            return Err(Error::dependency(
                "parse_manifest",
                "manifest document is not a mapping",
            ));
        }
        docs.push(ManifestDoc::from_value(value)?);
    }

    docs.sort_by_key(|d| kind_priority(d.kind()));
    Ok(docs)
}

async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    retry_with_backoff(&RetryConfig::discovery(), "api-discovery", || {
        Discovery::new(client.clone()).run()
    })
    .await
    .map_err(|e| Error::dependency("api-discovery", e.to_string()))
}

async fn apply_doc(client: &Client, discovery: &Discovery, doc: &ManifestDoc) -> Result<(), Error> {
    let (resource, capabilities) = discovery.resolve_gvk(&doc.gvk).ok_or_else(|| {
        Error::dependency(
            "apply_manifest",
            format!(
                "unknown resource type {}/{} {}",
                doc.gvk.group, doc.gvk.version, doc.gvk.kind
            ),
        )
    })?;

    let api: Api<DynamicObject> = match capabilities.scope {
        Scope::Namespaced => Api::namespaced_with(
            client.clone(),
            doc.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE),
            &resource,
        ),
        Scope::Cluster => Api::all_with(client.clone(), &resource),
    };

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&doc.name, &params, &Patch::Apply(&doc.value))
        .await
        .map_err(|e| {
            Error::dependency(
                "apply_manifest",
                format!("failed to apply {}/{}: {}", doc.kind(), doc.name, e),
            )
        })?;

    trace!(kind = %doc.kind(), name = %doc.name, namespace = ?doc.namespace, "applied manifest");
    Ok(())
}

/// Apply ordered documents.
///
/// Namespaces and CRDs are applied fail-fast; discovery is re-run after CRDs
/// so custom resources later in the same manifest resolve. Remaining
/// documents are applied best-effort and the first error is returned after
/// all have been attempted.
pub async fn apply_documents(client: &Client, docs: &[ManifestDoc]) -> Result<(), Error> {
    if docs.is_empty() {
        return Ok(());
    }

    let (foundational, rest): (Vec<&ManifestDoc>, Vec<&ManifestDoc>) = docs
        .iter()
        .partition(|d| matches!(d.kind(), "Namespace" | "CustomResourceDefinition"));

    let mut discovery = run_discovery(client).await?;

    if !foundational.is_empty() {
        for doc in &foundational {
            apply_doc(client, &discovery, doc).await?;
        }
        if foundational
            .iter()
            .any(|d| d.kind() == "CustomResourceDefinition")
        {
            discovery = run_discovery(client).await?;
        }
    }

    let mut first_error = None;
    let mut failed = 0usize;
    for doc in &rest {
        if let Err(e) = apply_doc(client, &discovery, doc).await {
            failed += 1;
            warn!(error = %e, kind = %doc.kind(), name = %doc.name, "continuing despite manifest apply failure");
            first_error.get_or_insert(e);
        }
    }

    debug!(
        applied = docs.len() - failed,
        failed,
        "manifest apply finished"
    );

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
