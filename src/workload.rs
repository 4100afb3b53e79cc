//! Sample workload smoke test
//!
//! Deploys a small nginx deployment behind a NodePort service and waits for
//! it to become available. Reaching this point means scheduling, image pulls
//! and service allocation all work on the new cluster.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::client::{ClusterClient, DeploymentStatus, ServiceType, WaitTarget};
use crate::clock::{Clock, Deadline};
use crate::Error;

/// Interval between replica count reads after the deployment reports Available
const REPLICA_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Sample deployment settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// Namespace to deploy into
    pub namespace: String,
    /// Deployment and service name
    pub name: String,
    /// Container image
    pub image: String,
    /// Desired replica count
    pub replicas: i32,
    /// Container and service port
    pub port: u16,
    /// Budget for the deployment to become available
    pub ready_timeout: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name: "kindling-sample".to_string(),
            image: "nginx:1.27-alpine".to_string(),
            replicas: 2,
            port: 80,
            ready_timeout: Duration::from_secs(180),
        }
    }
}

/// Deploys and exposes the sample workload
pub struct SampleWorkload {
    client: Arc<dyn ClusterClient>,
    clock: Arc<dyn Clock>,
    config: WorkloadConfig,
}

impl SampleWorkload {
    /// Create a deployer for `config`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        clock: Arc<dyn Clock>,
        config: WorkloadConfig,
    ) -> Self {
        Self {
            client,
            clock,
            config,
        }
    }

    /// Create, expose and wait; returns the allocated node port
    pub async fn deploy(&self) -> Result<u16, Error> {
        let cfg = &self.config;
        let deadline = Deadline::start(self.clock.clone(), cfg.ready_timeout);

        info!(name = %cfg.name, image = %cfg.image, replicas = cfg.replicas, "deploying sample workload");
        self.client
            .create_deployment(&cfg.namespace, &cfg.name, &cfg.image, cfg.replicas, cfg.port)
            .await?;

        let service = self
            .client
            .expose_service(&cfg.namespace, &cfg.name, cfg.port, ServiceType::NodePort)
            .await?;
        let node_port = service.node_port.ok_or_else(|| {
            Error::dependency("expose_service", format!("service {} has no node port", cfg.name))
        })?;

        self.client
            .wait_for_condition(
                &WaitTarget::deployment_available(&cfg.namespace, &cfg.name),
                cfg.ready_timeout,
            )
            .await?;

        let status = self.wait_for_all_replicas(&deadline).await?;

        info!(
            name = %cfg.name,
            available = status.available_replicas,
            node_port,
            "sample workload available"
        );
        Ok(node_port)
    }

    /// `Available` only guarantees `replicas - maxUnavailable`; keep reading
    /// until every desired replica is up or the budget runs out.
    async fn wait_for_all_replicas(
        &self,
        deadline: &Deadline,
    ) -> Result<DeploymentStatus, Error> {
        let cfg = &self.config;
        loop {
            let status = self
                .client
                .get_deployment_status(&cfg.namespace, &cfg.name)
                .await?;
            if status.is_available() {
                return Ok(status);
            }
            if deadline.expired() {
                return Err(Error::timeout(
                    format!("deployment {}", cfg.name),
                    status.available_replicas.max(0) as usize,
                    status.desired_replicas.max(0) as usize,
                    deadline.elapsed(),
                ));
            }
            debug!(
                name = %cfg.name,
                available = status.available_replicas,
                desired = status.desired_replicas,
                "waiting for remaining replicas"
            );
            self.clock
                .sleep(REPLICA_POLL_INTERVAL.min(deadline.remaining()))
                .await;
        }
    }
}
