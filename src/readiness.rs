//! Node readiness convergence
//!
//! [`ReadinessPoller`] samples the node list on a fixed interval until every
//! node reports `Ready` or the overall timeout runs out. Stale readiness
//! taints are remediated on a slower cadence of their own, so a busy poll
//! interval never turns into a stream of taint patches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::client::{ClusterClient, NodeInfo};
use crate::clock::{Clock, Deadline};
use crate::remediation::{TaintRemediator, STALE_TAINT_KEYS};
use crate::Error;

/// Timing knobs for a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Overall budget for the wait
    pub timeout: Duration,
    /// Pause between node samples
    pub poll_interval: Duration,
    /// Minimum spacing between remediation passes
    pub remediation_interval: Duration,
    /// Pause after a remediation pass that changed something
    pub settle_delay: Duration,
    /// Pause before re-listing when no node has registered yet
    pub no_nodes_delay: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(15),
            remediation_interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(20),
            no_nodes_delay: Duration::from_secs(10),
        }
    }
}

/// Loop state carried from one sample to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    /// Time since the wait started, as of the last sample
    pub elapsed: Duration,
    /// Ready nodes in the last sample
    pub ready: usize,
    /// All nodes in the last sample
    pub total: usize,
    /// When remediation last ran (the wait's start until the first pass)
    pub last_remediation: Instant,
}

impl PollState {
    fn new(started_at: Instant) -> Self {
        Self {
            elapsed: Duration::ZERO,
            ready: 0,
            total: 0,
            last_remediation: started_at,
        }
    }

    fn record(&mut self, nodes: &[NodeInfo], elapsed: Duration) {
        self.elapsed = elapsed;
        self.total = nodes.len();
        self.ready = nodes.iter().filter(|n| n.ready).count();
    }
}

/// What a single sample looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollObservation {
    /// Node list was empty
    NoNodes,
    /// Every node is ready
    AllReady,
    /// Some nodes are not ready and none of them carries a stale taint
    TransientUnready,
    /// Some unready nodes carry stale readiness taints
    RemediableFault,
}

impl PollObservation {
    /// Classify a node sample
    pub fn classify(nodes: &[NodeInfo]) -> Self {
        if nodes.is_empty() {
            return PollObservation::NoNodes;
        }
        let unready: Vec<&NodeInfo> = nodes.iter().filter(|n| !n.ready).collect();
        if unready.is_empty() {
            PollObservation::AllReady
        } else if unready.iter().any(|n| n.has_any_taint(&STALE_TAINT_KEYS)) {
            PollObservation::RemediableFault
        } else {
            PollObservation::TransientUnready
        }
    }
}

/// Terminal outcome of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceResult {
    /// All nodes reported ready
    Converged {
        /// Ready nodes
        ready: usize,
        /// All nodes
        total: usize,
        /// Time taken to converge
        elapsed: Duration,
    },
    /// The timeout ran out first; counts are from the last sample
    TimedOut {
        /// Ready nodes in the last sample
        ready: usize,
        /// All nodes in the last sample
        total: usize,
        /// The timeout that ran out
        limit: Duration,
    },
}

impl ConvergenceResult {
    /// True for [`ConvergenceResult::Converged`]
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged { .. })
    }

    /// (ready, total) as last observed
    pub fn counts(&self) -> (usize, usize) {
        match *self {
            ConvergenceResult::Converged { ready, total, .. }
            | ConvergenceResult::TimedOut { ready, total, .. } => (ready, total),
        }
    }

    /// Turn a timeout into [`Error::TimeoutExceeded`]
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            ConvergenceResult::TimedOut {
                ready,
                total,
                limit,
            } => Err(Error::timeout("nodes ready", ready, total, limit)),
            converged => Ok(converged),
        }
    }
}

/// Waits for every node to become ready, remediating stale taints on the way
pub struct ReadinessPoller {
    client: Arc<dyn ClusterClient>,
    remediator: TaintRemediator,
    clock: Arc<dyn Clock>,
    config: ReadinessConfig,
}

impl ReadinessPoller {
    /// Create a poller over `client`, timed by `clock`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        clock: Arc<dyn Clock>,
        config: ReadinessConfig,
    ) -> Self {
        Self {
            remediator: TaintRemediator::new(client.clone()),
            client,
            clock,
            config,
        }
    }

    /// Poll until converged or timed out.
    ///
    /// Only a failed node listing is an error; an unready cluster at the
    /// deadline is reported as [`ConvergenceResult::TimedOut`].
    pub async fn run(&self) -> Result<ConvergenceResult, Error> {
        let deadline = Deadline::start(self.clock.clone(), self.config.timeout);
        let mut state = PollState::new(deadline.started_at());

        info!(
            timeout_secs = self.config.timeout.as_secs(),
            "waiting for all nodes to become ready"
        );

        loop {
            let nodes = self.client.list_nodes().await?;
            state.record(&nodes, deadline.elapsed());
            let observation = PollObservation::classify(&nodes);

            if observation == PollObservation::NoNodes {
                debug!(elapsed_secs = state.elapsed.as_secs(), "no nodes registered yet");
                self.clock.sleep(self.config.no_nodes_delay).await;
                if deadline.expired() {
                    warn!("timed out with no nodes registered");
                    return Ok(self.timed_out(&state));
                }
                continue;
            }

            if observation == PollObservation::AllReady {
                info!(
                    ready = state.ready,
                    total = state.total,
                    elapsed_secs = state.elapsed.as_secs(),
                    "all nodes ready"
                );
                return Ok(ConvergenceResult::Converged {
                    ready: state.ready,
                    total: state.total,
                    elapsed: state.elapsed,
                });
            }

            if deadline.expired() {
                warn!(
                    ready = state.ready,
                    total = state.total,
                    "timed out waiting for nodes"
                );
                return Ok(self.timed_out(&state));
            }

            info!(
                ready = state.ready,
                total = state.total,
                elapsed_secs = state.elapsed.as_secs(),
                ?observation,
                "nodes not ready yet"
            );

            if deadline.since(state.last_remediation) >= self.config.remediation_interval {
                state.last_remediation = deadline.now();
                let outcome = self.remediator.remediate(&nodes).await;
                if outcome.any_changed {
                    debug!(
                        nodes = ?outcome.nodes_touched,
                        settle_secs = self.config.settle_delay.as_secs(),
                        "waiting for taint removal to settle"
                    );
                    self.clock.sleep(self.config.settle_delay).await;
                }
            }

            self.clock.sleep(self.config.poll_interval).await;
        }
    }

    fn timed_out(&self, state: &PollState) -> ConvergenceResult {
        ConvergenceResult::TimedOut {
            ready: state.ready,
            total: state.total,
            limit: self.config.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterClient, TaintEffect, TAINT_NOT_READY, TAINT_UNREACHABLE};
    use crate::testing::{FakeClock, FakeCluster};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn poller(cluster: Arc<FakeCluster>, clock: Arc<FakeClock>) -> ReadinessPoller {
        ReadinessPoller::new(cluster, clock, ReadinessConfig::default())
    }

    #[tokio::test]
    async fn all_ready_converges_on_first_sample_without_remediation() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes().times(1).returning(|| {
            Ok(vec![
                NodeInfo::new("cp", true, Vec::<String>::new()),
                NodeInfo::new("w1", true, Vec::<String>::new()),
            ])
        });
        mock.expect_remove_taint().never();

        let clock = Arc::new(FakeClock::new());
        let result = ReadinessPoller::new(Arc::new(mock), clock, ReadinessConfig::default())
            .run()
            .await
            .unwrap();

        assert_eq!(
            result,
            ConvergenceResult::Converged {
                ready: 2,
                total: 2,
                elapsed: Duration::ZERO
            }
        );
    }

    #[tokio::test]
    async fn story_stale_taint_is_removed_and_cluster_converges() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(
            FakeCluster::new(clock.clone())
                .with_stale_node("a", &[(TAINT_NOT_READY, TaintEffect::NoSchedule)])
                .with_node("b", true, &[])
                .with_node("c", true, &[]),
        );

        let result = poller(cluster.clone(), clock.clone()).run().await.unwrap();

        // First samples see 2/3; remediation is due at t=30
        assert_eq!(cluster.list_calls()[..3], [secs(0), secs(15), secs(30)]);
        let removals = cluster.removals();
        assert_eq!(removals.len(), 4);
        assert!(removals.iter().all(|r| r.node == "a" && r.at == secs(30)));

        // 30 + 20 settle + 15 poll
        assert_eq!(
            result,
            ConvergenceResult::Converged {
                ready: 3,
                total: 3,
                elapsed: secs(65)
            }
        );
    }

    #[tokio::test]
    async fn timeout_reports_counts_from_last_sample() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(
            FakeCluster::new(clock.clone())
                .with_node("cp", true, &[])
                .with_node("w1", false, &[])
                .with_node("w2", true, &[]),
        );

        let result = poller(cluster.clone(), clock.clone()).run().await.unwrap();

        assert_eq!(
            result,
            ConvergenceResult::TimedOut {
                ready: 2,
                total: 3,
                limit: secs(600)
            }
        );
        assert_eq!(cluster.list_calls().last(), Some(&secs(600)));
        assert!(cluster.removals().is_empty());

        let err = result.into_result().unwrap_err();
        assert!(matches!(
            err,
            Error::TimeoutExceeded {
                ready: 2,
                total: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remediation_respects_its_own_cadence() {
        let clock = Arc::new(FakeClock::new());
        // Removal always fails, so the taint stays and every pass retries it
        let cluster = Arc::new(
            FakeCluster::new(clock.clone())
                .with_node(
                    "w1",
                    false,
                    &[
                        (TAINT_NOT_READY, TaintEffect::NoSchedule),
                        (TAINT_UNREACHABLE, TaintEffect::NoExecute),
                    ],
                )
                .with_failing_node("w1"),
        );

        let config = ReadinessConfig::default();
        let result = ReadinessPoller::new(cluster.clone(), clock.clone(), config)
            .run()
            .await
            .unwrap();
        assert!(!result.is_converged());

        let mut passes: Vec<Duration> = cluster.removals().iter().map(|r| r.at).collect();
        passes.dedup();

        let bound = config.timeout.as_secs().div_ceil(config.remediation_interval.as_secs()) + 1;
        assert!(!passes.is_empty());
        assert!(passes.len() as u64 <= bound);
        assert_eq!(cluster.removals().len(), passes.len() * 4);
        assert!(passes
            .windows(2)
            .all(|w| w[1] - w[0] >= config.remediation_interval));
        assert!(passes[0] >= config.remediation_interval);
    }

    #[tokio::test]
    async fn fast_polling_does_not_speed_up_remediation() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(
            FakeCluster::new(clock.clone())
                .with_node("w1", false, &[(TAINT_UNREACHABLE, TaintEffect::NoExecute)])
                .with_failing_node("w1"),
        );
        let config = ReadinessConfig {
            timeout: secs(120),
            poll_interval: secs(1),
            ..ReadinessConfig::default()
        };

        ReadinessPoller::new(cluster.clone(), clock, config)
            .run()
            .await
            .unwrap();

        let mut passes: Vec<Duration> = cluster.removals().iter().map(|r| r.at).collect();
        passes.dedup();
        assert_eq!(passes, vec![secs(30), secs(60), secs(90)]);
        assert_eq!(cluster.list_calls().len(), 121);
    }

    #[tokio::test]
    async fn empty_cluster_times_out_with_zero_counts() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(FakeCluster::new(clock.clone()));
        let config = ReadinessConfig {
            timeout: secs(60),
            ..ReadinessConfig::default()
        };

        let result = ReadinessPoller::new(cluster.clone(), clock, config)
            .run()
            .await
            .unwrap();

        assert_eq!(
            result,
            ConvergenceResult::TimedOut {
                ready: 0,
                total: 0,
                limit: secs(60)
            }
        );
        assert_eq!(
            cluster.list_calls(),
            vec![secs(0), secs(10), secs(20), secs(30), secs(40), secs(50)]
        );
    }

    #[tokio::test]
    async fn story_nodes_registering_late_still_converge() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(FakeCluster::new(clock.clone()).with_node_joining_at(
            secs(25),
            "cp",
            true,
        ));

        let result = poller(cluster, clock).run().await.unwrap();

        assert_eq!(
            result,
            ConvergenceResult::Converged {
                ready: 1,
                total: 1,
                elapsed: secs(30)
            }
        );
    }

    #[tokio::test]
    async fn story_node_joining_mid_wait_is_counted_in_the_next_sample() {
        let clock = Arc::new(FakeClock::new());
        let cluster = Arc::new(
            FakeCluster::new(clock.clone())
                .with_node("cp", true, &[])
                .with_stale_node("w1", &[(TAINT_UNREACHABLE, TaintEffect::NoSchedule)])
                .with_node_joining_at(secs(40), "w2", true),
        );

        let result = poller(cluster, clock).run().await.unwrap();

        assert_eq!(
            result,
            ConvergenceResult::Converged {
                ready: 3,
                total: 3,
                elapsed: secs(65)
            }
        );
    }

    #[tokio::test]
    async fn node_listing_failure_is_fatal() {
        let mut mock = MockClusterClient::new();
        mock.expect_list_nodes()
            .times(1)
            .returning(|| Err(Error::dependency("list_nodes", "connection refused")));

        let clock = Arc::new(FakeClock::new());
        let err = ReadinessPoller::new(Arc::new(mock), clock, ReadinessConfig::default())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Dependency { .. }));
    }

    #[test]
    fn observation_distinguishes_stale_taints_from_plain_unreadiness() {
        let ready = NodeInfo::new("a", true, Vec::<String>::new());
        let booting = NodeInfo::new("b", false, Vec::<String>::new());
        let stale = NodeInfo::new("c", false, [TAINT_NOT_READY]);

        assert_eq!(PollObservation::classify(&[]), PollObservation::NoNodes);
        assert_eq!(
            PollObservation::classify(&[ready.clone()]),
            PollObservation::AllReady
        );
        assert_eq!(
            PollObservation::classify(&[ready.clone(), booting.clone()]),
            PollObservation::TransientUnready
        );
        assert_eq!(
            PollObservation::classify(&[ready, booting, stale]),
            PollObservation::RemediableFault
        );
    }
}
