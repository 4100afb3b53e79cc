//! Bootstrap orchestration
//!
//! Runs the phases in order: prerequisites, cluster creation and context
//! switch, CNI install, readiness convergence, network validation and the
//! sample workload. The first failure stops the run and is reported with the
//! phase it happened in. Nothing already created is rolled back.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::cni::CniInstaller;
use crate::config::BootstrapConfig;
use crate::error::{Phase, PhaseExt, PhaseFailure};
use crate::provision::{ClusterProvisioner, KindProvisioner, Prerequisites, ToolCheck};
use crate::readiness::{ConvergenceResult, ReadinessPoller};
use crate::validation::NetworkValidator;
use crate::workload::SampleWorkload;

/// Summary of a successful bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapReport {
    /// How node readiness converged
    pub readiness: ConvergenceResult,
    /// Whether the best-effort outbound HTTP check passed
    pub http_reachable: bool,
    /// Node port allocated to the sample workload
    pub sample_node_port: u16,
    /// Wall time for the whole run
    pub elapsed: Duration,
}

/// Sequences the bootstrap phases
pub struct Bootstrapper {
    config: BootstrapConfig,
    prerequisites: Arc<dyn Prerequisites>,
    provisioner: Arc<dyn ClusterProvisioner>,
    clock: Arc<dyn Clock>,
}

impl Bootstrapper {
    /// Create a bootstrapper from explicit collaborators
    pub fn new(
        config: BootstrapConfig,
        prerequisites: Arc<dyn Prerequisites>,
        provisioner: Arc<dyn ClusterProvisioner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            prerequisites,
            provisioner,
            clock,
        }
    }

    /// Bootstrapper that provisions with kind on the local docker host
    pub fn kind(config: BootstrapConfig) -> Self {
        Self::new(
            config,
            Arc::new(ToolCheck),
            Arc::new(KindProvisioner),
            Arc::new(SystemClock),
        )
    }

    /// Run every phase
    pub async fn run(&self) -> Result<BootstrapReport, PhaseFailure> {
        let started = self.clock.now();

        enter(Phase::Prerequisites);
        self.prerequisites
            .check()
            .await
            .in_phase(Phase::Prerequisites)?;

        enter(Phase::ClusterCreate);
        let spec = self.config.cluster_spec();
        self.provisioner
            .create(&spec)
            .await
            .in_phase(Phase::ClusterCreate)?;
        let client = self
            .provisioner
            .connect(&spec)
            .await
            .in_phase(Phase::ClusterCreate)?;

        enter(Phase::CniWait);
        CniInstaller::new(client.clone(), self.clock.clone(), self.config.cni_config())
            .install()
            .await
            .in_phase(Phase::CniWait)?;

        enter(Phase::Readiness);
        let convergence = ReadinessPoller::new(
            client.clone(),
            self.clock.clone(),
            self.config.readiness_config(),
        )
        .run()
        .await
        .in_phase(Phase::Readiness)?;
        let nodes = convergence.counts();
        let readiness = convergence
            .into_result()
            .in_phase(Phase::Readiness)
            .map_err(|f| f.with_nodes(nodes))?;

        enter(Phase::NetworkValidation);
        let validation = NetworkValidator::new(client.clone(), self.config.validation_config())
            .validate()
            .await
            .in_phase(Phase::NetworkValidation)
            .map_err(|f| f.with_nodes(nodes))?;

        enter(Phase::SampleWorkload);
        let workload =
            SampleWorkload::new(client, self.clock.clone(), self.config.workload_config());
        let sample_node_port = workload
            .deploy()
            .await
            .in_phase(Phase::SampleWorkload)
            .map_err(|f| f.with_nodes(nodes))?;

        let report = BootstrapReport {
            readiness,
            http_reachable: validation.http_reachable,
            sample_node_port,
            elapsed: self.clock.now().saturating_duration_since(started),
        };

        let (ready, total) = report.readiness.counts();
        info!(
            cluster = %spec.name,
            context = %spec.context(),
            ready,
            total,
            http_reachable = report.http_reachable,
            node_port = report.sample_node_port,
            elapsed_secs = report.elapsed.as_secs(),
            "cluster bootstrap complete"
        );
        Ok(report)
    }
}

fn enter(phase: Phase) {
    info!(%phase, "starting phase");
}
