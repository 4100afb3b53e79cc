//! Test doubles: a manually driven clock and an in-memory cluster

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::client::{
    ClusterClient, DeploymentStatus, ExecOutput, ExposedService, ManifestSource, NodeInfo,
    PodInfo, ServiceType, TaintEffect, WaitTarget, TAINT_NOT_READY, TAINT_UNREACHABLE,
};
use crate::clock::Clock;
use crate::Error;

/// Clock whose `sleep` returns immediately after advancing fake time
pub struct FakeClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }

    /// Fake time since construction
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// A recorded `remove_taint` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintRemoval {
    pub at: Duration,
    pub node: String,
    pub key: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone)]
struct FakeNode {
    name: String,
    ready: bool,
    taints: BTreeSet<(String, TaintEffect)>,
    /// Node turns ready once no stale readiness taint remains
    heals_when_untainted: bool,
}

/// In-memory cluster holding nodes and their taints.
///
/// Only the node operations are modelled; everything else succeeds
/// trivially so the convergence code can be driven end to end.
pub struct FakeCluster {
    clock: Arc<FakeClock>,
    nodes: Mutex<Vec<FakeNode>>,
    removals: Mutex<Vec<TaintRemoval>>,
    list_calls: Mutex<Vec<Duration>>,
    failing_nodes: Mutex<BTreeSet<String>>,
    /// (at, node) pairs: node joins the cluster once fake time reaches `at`
    pending_joins: Mutex<Vec<(Duration, FakeNode)>>,
}

impl FakeCluster {
    pub fn new(clock: Arc<FakeClock>) -> Self {
        Self {
            clock,
            nodes: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            list_calls: Mutex::new(Vec::new()),
            failing_nodes: Mutex::new(BTreeSet::new()),
            pending_joins: Mutex::new(Vec::new()),
        }
    }

    fn make_node(name: &str, ready: bool, taints: &[(&str, TaintEffect)]) -> FakeNode {
        FakeNode {
            name: name.to_string(),
            ready,
            taints: taints.iter().map(|(k, e)| (k.to_string(), *e)).collect(),
            heals_when_untainted: false,
        }
    }

    pub fn with_node(self, name: &str, ready: bool, taints: &[(&str, TaintEffect)]) -> Self {
        self.nodes
            .lock()
            .unwrap()
            .push(Self::make_node(name, ready, taints));
        self
    }

    /// Unready node that becomes ready once its stale taints are removed
    pub fn with_stale_node(self, name: &str, taints: &[(&str, TaintEffect)]) -> Self {
        let mut node = Self::make_node(name, false, taints);
        node.heals_when_untainted = true;
        self.nodes.lock().unwrap().push(node);
        self
    }

    /// Node that appears in listings from fake time `at` onwards
    pub fn with_node_joining_at(self, at: Duration, name: &str, ready: bool) -> Self {
        self.pending_joins
            .lock()
            .unwrap()
            .push((at, Self::make_node(name, ready, &[])));
        self
    }

    /// Every `remove_taint` call on `name` fails
    pub fn with_failing_node(self, name: &str) -> Self {
        self.failing_nodes.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn removals(&self) -> Vec<TaintRemoval> {
        self.removals.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> Vec<Duration> {
        self.list_calls.lock().unwrap().clone()
    }

    pub fn taints_of(&self, name: &str) -> Vec<(String, TaintEffect)> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.taints.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn admit_joined_nodes(&self) {
        let now = self.clock.elapsed();
        let mut pending = self.pending_joins.lock().unwrap();
        let mut nodes = self.nodes.lock().unwrap();
        pending.retain(|(at, node)| {
            if *at <= now {
                nodes.push(node.clone());
                false
            } else {
                true
            }
        });
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.admit_joined_nodes();
        self.list_calls.lock().unwrap().push(self.clock.elapsed());
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| NodeInfo {
                name: n.name.clone(),
                ready: n.ready,
                taint_keys: n.taints.iter().map(|(k, _)| k.clone()).collect(),
            })
            .collect())
    }

    async fn remove_taint(&self, node: &str, key: &str, effect: TaintEffect) -> Result<(), Error> {
        self.removals.lock().unwrap().push(TaintRemoval {
            at: self.clock.elapsed(),
            node: node.to_string(),
            key: key.to_string(),
            effect,
        });

        if self.failing_nodes.lock().unwrap().contains(node) {
            return Err(Error::dependency("remove_taint", "injected failure"));
        }

        let mut nodes = self.nodes.lock().unwrap();
        if let Some(n) = nodes.iter_mut().find(|n| n.name == node) {
            n.taints.remove(&(key.to_string(), effect));
            let stale = n
                .taints
                .iter()
                .any(|(k, _)| k == TAINT_NOT_READY || k == TAINT_UNREACHABLE);
            if n.heals_when_untainted && !stale {
                n.ready = true;
            }
        }
        Ok(())
    }

    async fn apply_manifest(&self, _source: &ManifestSource) -> Result<(), Error> {
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _labels: &str) -> Result<Vec<PodInfo>, Error> {
        Ok(Vec::new())
    }

    async fn wait_for_condition(
        &self,
        _target: &WaitTarget,
        _timeout: Duration,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn get_deployment_status(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<DeploymentStatus, Error> {
        Ok(DeploymentStatus::default())
    }

    async fn run_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _image: &str,
        _command: &[String],
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        _namespace: &str,
        _name: &str,
        _command: &[String],
    ) -> Result<ExecOutput, Error> {
        Ok(ExecOutput {
            success: true,
            ..Default::default()
        })
    }

    async fn create_deployment(
        &self,
        _namespace: &str,
        _name: &str,
        _image: &str,
        _replicas: i32,
        _port: u16,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn expose_service(
        &self,
        _namespace: &str,
        _name: &str,
        _port: u16,
        _service_type: ServiceType,
    ) -> Result<ExposedService, Error> {
        Ok(ExposedService { node_port: None })
    }
}
