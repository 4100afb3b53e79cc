//! CNI installation and wait
//!
//! kind clusters are created with the default CNI disabled, so nothing
//! schedules until a network plugin is running. The installer applies the
//! plugin manifest and waits in two bounded phases: first for the daemon
//! pods to exist at all, then for the controller and every daemon pod to
//! report healthy.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::client::{ClusterClient, ManifestSource, WaitTarget};
use crate::clock::{Clock, Deadline};
use crate::Error;

/// Calico release installed when none is configured
pub const DEFAULT_CNI_VERSION: &str = "v3.27.3";

/// Manifest location; `{version}` is replaced with the configured release
pub const DEFAULT_MANIFEST_TEMPLATE: &str =
    "https://raw.githubusercontent.com/projectcalico/calico/{version}/manifests/calico.yaml";

/// What to install and what to wait on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniConfig {
    /// Manifest to apply
    pub manifest: ManifestSource,
    /// Namespace the plugin runs in
    pub namespace: String,
    /// Controller deployment that must become available
    pub controller_deployment: String,
    /// Label selector of the per-node daemon pods
    pub daemon_selector: String,
    /// Pause between existence checks
    pub existence_poll: Duration,
    /// Budget for the daemon pods to appear
    pub existence_timeout: Duration,
    /// Budget for each availability wait
    pub availability_timeout: Duration,
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            manifest: ManifestSource::parse(&manifest_location(
                DEFAULT_MANIFEST_TEMPLATE,
                DEFAULT_CNI_VERSION,
            )),
            namespace: "kube-system".to_string(),
            controller_deployment: "calico-kube-controllers".to_string(),
            daemon_selector: "k8s-app=calico-node".to_string(),
            existence_poll: Duration::from_secs(5),
            existence_timeout: Duration::from_secs(120),
            availability_timeout: Duration::from_secs(300),
        }
    }
}

/// Expand `{version}` in a manifest location template
pub fn manifest_location(template: &str, version: &str) -> String {
    template.replace("{version}", version)
}

/// Applies the CNI manifest and waits for the plugin to come up
pub struct CniInstaller {
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    config: CniConfig,
}

impl CniInstaller {
    /// Create an installer
    pub fn new(client: Arc<dyn ClusterClient>, clock: Arc<dyn Clock>, config: CniConfig) -> Self {
        Self {
            client,
            clock,
            config,
        }
    }

    /// Apply the manifest, then wait for existence and availability
    pub async fn install(&self) -> Result<(), Error> {
        info!(manifest = %self.config.manifest, "applying CNI manifest");
        self.client.apply_manifest(&self.config.manifest).await?;

        let pods = self.wait_for_daemon_pods().await?;
        info!(pods, "CNI daemon pods scheduled, waiting for availability");

        self.wait_until_available().await?;
        info!("CNI is ready");
        Ok(())
    }

    /// Poll until at least one daemon pod exists; returns how many were seen
    async fn wait_for_daemon_pods(&self) -> Result<usize, Error> {
        let deadline = Deadline::start(self.clock.clone(), self.config.existence_timeout);

        loop {
            let pods = self
                .client
                .list_pods(&self.config.namespace, &self.config.daemon_selector)
                .await?;
            if !pods.is_empty() {
                return Ok(pods.len());
            }

            if deadline.expired() {
                return Err(Error::dependency(
                    "cni",
                    format!(
                        "no pods matching {} in {} after {}s",
                        self.config.daemon_selector,
                        self.config.namespace,
                        deadline.elapsed().as_secs()
                    ),
                ));
            }

            debug!(
                selector = %self.config.daemon_selector,
                elapsed_secs = deadline.elapsed().as_secs(),
                "CNI daemon pods not created yet"
            );
            self.clock.sleep(self.config.existence_poll).await;
        }
    }

    async fn wait_until_available(&self) -> Result<(), Error> {
        let targets = [
            WaitTarget::deployment_available(
                &self.config.namespace,
                &self.config.controller_deployment,
            ),
            WaitTarget::pods_ready(&self.config.namespace, &self.config.daemon_selector),
        ];

        for target in &targets {
            debug!(%target, timeout_secs = self.config.availability_timeout.as_secs(), "waiting");
            self.client
                .wait_for_condition(target, self.config.availability_timeout)
                .await?;
        }
        Ok(())
    }
}
