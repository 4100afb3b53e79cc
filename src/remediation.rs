//! Stale readiness taint remediation
//!
//! The node lifecycle controller taints nodes with `not-ready`/`unreachable`
//! while their kubelet is not reporting. On a fresh kind cluster those taints
//! sometimes outlive the condition that caused them, keeping workloads off an
//! otherwise healthy node. The remediator strips exactly those two keys and
//! nothing else.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::{ClusterClient, NodeInfo, TaintEffect, TAINT_NOT_READY, TAINT_UNREACHABLE};

/// The only taint keys remediation ever removes
pub const STALE_TAINT_KEYS: [&str; 2] = [TAINT_NOT_READY, TAINT_UNREACHABLE];

/// What a remediation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationOutcome {
    /// At least one taint removal went through
    pub any_changed: bool,
    /// Nodes that had at least one removal go through
    pub nodes_touched: Vec<String>,
}

/// Removes stale readiness taints from nodes
pub struct TaintRemediator {
    client: Arc<dyn ClusterClient>,
}

impl TaintRemediator {
    /// Create a remediator issuing removals through `client`
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Strip stale readiness taints from every node carrying one.
    ///
    /// A node qualifies if it has either key under any effect; it then gets a
    /// removal for both keys under both effects. Removal failures are logged
    /// and skipped so one bad node can't block the others.
    pub async fn remediate(&self, nodes: &[NodeInfo]) -> RemediationOutcome {
        let mut outcome = RemediationOutcome::default();

        for node in nodes.iter().filter(|n| n.has_any_taint(&STALE_TAINT_KEYS)) {
            info!(node = %node.name, "removing stale readiness taints");

            let mut removed_any = false;
            for key in STALE_TAINT_KEYS {
                for effect in TaintEffect::ALL {
                    match self.client.remove_taint(&node.name, key, effect).await {
                        Ok(()) => removed_any = true,
                        Err(e) => warn!(
                            node = %node.name,
                            key,
                            %effect,
                            error = %e,
                            "continuing despite failed taint removal"
                        ),
                    }
                }
            }

            if removed_any {
                outcome.nodes_touched.push(node.name.clone());
            }
        }

        outcome.any_changed = !outcome.nodes_touched.is_empty();
        if !outcome.any_changed {
            debug!("no stale readiness taints found");
        }
        outcome
    }
}
