//! Post-convergence network validation
//!
//! A throwaway busybox pod is started and used to check cluster DNS, outbound
//! HTTP, ICMP to an external address and ICMP to another pod over the CNI.
//! The pod is deleted exactly once on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::{ClusterClient, ExecOutput, WaitTarget};
use crate::Error;

/// Check targets and the diagnostic pod to run them from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Namespace of the diagnostic pod
    pub namespace: String,
    /// Name of the diagnostic pod
    pub pod_name: String,
    /// Image providing `nslookup`, `wget` and `ping`
    pub image: String,
    /// In-cluster name that must resolve
    pub dns_name: String,
    /// External URL checked best-effort
    pub http_url: String,
    /// External address that must answer ICMP
    pub ping_address: String,
    /// Namespace of the pods that must answer ICMP over the pod network
    pub peer_namespace: String,
    /// Label selector of those pods; CoreDNS runs on the pod network and is
    /// already known to work once DNS resolves
    pub peer_selector: String,
    /// How long the pod may take to become ready
    pub pod_ready_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            pod_name: "kindling-netcheck".to_string(),
            image: "busybox:1.36".to_string(),
            dns_name: "kubernetes.default.svc.cluster.local".to_string(),
            http_url: "http://www.google.com".to_string(),
            ping_address: "8.8.8.8".to_string(),
            peer_namespace: "kube-system".to_string(),
            peer_selector: "k8s-app=kube-dns".to_string(),
            pod_ready_timeout: Duration::from_secs(120),
        }
    }
}

/// Results of checks that are allowed to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    /// Outbound HTTP worked
    pub http_reachable: bool,
}

/// Runs network checks from inside the cluster
pub struct NetworkValidator {
    client: Arc<dyn ClusterClient>,
    config: ValidationConfig,
}

impl NetworkValidator {
    /// Create a validator running checks through `client`
    pub fn new(client: Arc<dyn ClusterClient>, config: ValidationConfig) -> Self {
        Self { client, config }
    }

    /// Run every check, then delete the diagnostic pod.
    ///
    /// DNS, external ping and pod-to-pod ping failures are errors. An HTTP failure is logged and
    /// reported through [`ValidationReport::http_reachable`].
    pub async fn validate(&self) -> Result<ValidationReport, Error> {
        let result = self.run_checks().await;

        if let Err(e) = self
            .client
            .delete_pod(&self.config.namespace, &self.config.pod_name)
            .await
        {
            warn!(
                pod = %self.config.pod_name,
                error = %e,
                "continuing despite failed diagnostic pod cleanup"
            );
        }

        result
    }

    async fn run_checks(&self) -> Result<ValidationReport, Error> {
        let ns = &self.config.namespace;
        let pod = &self.config.pod_name;

        info!(pod = %pod, image = %self.config.image, "starting diagnostic pod");
        self.client
            .run_pod(ns, pod, &self.config.image, &command(&["sleep", "3600"]))
            .await?;
        self.client
            .wait_for_condition(&WaitTarget::pod_ready(ns, pod), self.config.pod_ready_timeout)
            .await?;

        let dns = self
            .exec(&["nslookup", self.config.dns_name.as_str()])
            .await?;
        if !dns.success {
            return Err(Error::validation("dns", failure_detail(&dns)));
        }
        info!(name = %self.config.dns_name, "cluster DNS resolves");

        let http_reachable = match self
            .exec(&["wget", "-q", "-T", "10", "-O", "/dev/null", self.config.http_url.as_str()])
            .await
        {
            Ok(out) if out.success => {
                info!(url = %self.config.http_url, "outbound HTTP reachable");
                true
            }
            Ok(out) => {
                warn!(
                    url = %self.config.http_url,
                    output = %failure_detail(&out),
                    "continuing despite failed outbound HTTP check"
                );
                false
            }
            Err(e) => {
                warn!(
                    url = %self.config.http_url,
                    error = %e,
                    "continuing despite failed outbound HTTP check"
                );
                false
            }
        };

        let ping = self
            .exec(&["ping", "-c", "3", "-W", "5", self.config.ping_address.as_str()])
            .await?;
        if !ping.success {
            return Err(Error::validation("ping", failure_detail(&ping)));
        }
        info!(address = %self.config.ping_address, "external address answers ping");

        self.check_pod_to_pod().await?;

        Ok(ValidationReport { http_reachable })
    }

    async fn check_pod_to_pod(&self) -> Result<(), Error> {
        let peers = self
            .client
            .list_pods(&self.config.peer_namespace, &self.config.peer_selector)
            .await?;
        let Some((peer, ip)) = peers
            .iter()
            .filter(|p| p.ready)
            .find_map(|p| p.ip.as_deref().map(|ip| (p.name.as_str(), ip)))
        else {
            return Err(Error::validation(
                "pod-to-pod",
                format!(
                    "no ready pod with an IP matches {} in {}",
                    self.config.peer_selector, self.config.peer_namespace
                ),
            ));
        };

        let out = self.exec(&["ping", "-c", "3", "-W", "5", ip]).await?;
        if !out.success {
            return Err(Error::validation(
                "pod-to-pod",
                format!("{} ({}): {}", peer, ip, failure_detail(&out)),
            ));
        }
        info!(peer, ip, "pod network reachable");
        Ok(())
    }

    async fn exec(&self, args: &[&str]) -> Result<ExecOutput, Error> {
        self.client
            .exec_in_pod(&self.config.namespace, &self.config.pod_name, &command(args))
            .await
    }
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn failure_detail(out: &ExecOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        out.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterClient, PodInfo};
    use std::sync::Mutex;

    fn ok() -> ExecOutput {
        ExecOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            success: true,
        }
    }

    fn failed(stderr: &str) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
        }
    }

    fn coredns(name: &str, ready: bool, ip: Option<&str>) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            ready,
            ip: ip.map(str::to_string),
        }
    }

    /// Mock with a running pod and one exec result per check
    fn cluster(dns: ExecOutput, http: ExecOutput, ping: ExecOutput) -> MockClusterClient {
        cluster_with_peers(
            dns,
            http,
            ping,
            ok(),
            vec![coredns("coredns-a", true, Some("192.168.10.4"))],
        )
    }

    fn cluster_with_peers(
        dns: ExecOutput,
        http: ExecOutput,
        ping: ExecOutput,
        peer_ping: ExecOutput,
        peers: Vec<PodInfo>,
    ) -> MockClusterClient {
        let mut mock = MockClusterClient::new();
        mock.expect_list_pods()
            .withf(|ns, labels| ns == "kube-system" && labels == "k8s-app=kube-dns")
            .returning(move |_, _| Ok(peers.clone()));
        mock.expect_run_pod().times(1).returning(|_, _, _, _| Ok(()));
        mock.expect_wait_for_condition()
            .withf(|target, timeout| {
                *target == WaitTarget::pod_ready("default", "kindling-netcheck")
                    && *timeout == Duration::from_secs(120)
            })
            .returning(|_, _| Ok(()));
        mock.expect_exec_in_pod()
            .returning(move |_, _, cmd| match cmd[0].as_str() {
                "nslookup" => Ok(dns.clone()),
                "wget" => Ok(http.clone()),
                "ping" if cmd.last().map(String::as_str) == Some("8.8.8.8") => Ok(ping.clone()),
                "ping" => Ok(peer_ping.clone()),
                other => panic!("unexpected command {other}"),
            });
        mock
    }

    #[tokio::test]
    async fn all_checks_pass() {
        let mut mock = cluster(ok(), ok(), ok());
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let report = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap();
        assert!(report.http_reachable);
    }

    #[tokio::test]
    async fn story_dns_failure_is_fatal_and_pod_is_still_deleted() {
        let mut mock = cluster(failed("can't resolve"), ok(), ok());
        mock.expect_delete_pod()
            .withf(|ns, name| ns == "default" && name == "kindling-netcheck")
            .times(1)
            .returning(|_, _| Ok(()));

        let err = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::Validation { ref check, ref message } if check == "dns" && message == "can't resolve")
        );
    }

    #[tokio::test]
    async fn http_failure_is_tolerated() {
        let mut mock = cluster(ok(), failed("wget: download timed out"), ok());
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let report = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap();
        assert!(!report.http_reachable);
    }

    #[tokio::test]
    async fn ping_failure_is_fatal() {
        let mut mock = cluster(ok(), ok(), failed("100% packet loss"));
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let err = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref check, .. } if check == "ping"));
    }

    #[tokio::test]
    async fn pod_to_pod_ping_targets_a_ready_pod_with_an_ip() {
        let commands = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let seen = commands.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_run_pod().returning(|_, _, _, _| Ok(()));
        mock.expect_wait_for_condition().returning(|_, _| Ok(()));
        mock.expect_list_pods().returning(|_, _| {
            Ok(vec![
                coredns("coredns-pending", false, Some("192.168.10.9")),
                coredns("coredns-new", true, None),
                coredns("coredns-a", true, Some("192.168.10.4")),
            ])
        });
        mock.expect_exec_in_pod().returning(move |_, _, cmd| {
            seen.lock().unwrap().push(cmd.to_vec());
            Ok(ok())
        });
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap();

        let commands = commands.lock().unwrap();
        let last = commands.last().expect("checks ran");
        assert_eq!(last[0], "ping");
        assert_eq!(last.last().map(String::as_str), Some("192.168.10.4"));
    }

    #[tokio::test]
    async fn pod_network_failure_is_fatal() {
        let mut mock = cluster_with_peers(
            ok(),
            ok(),
            ok(),
            failed("100% packet loss"),
            vec![coredns("coredns-a", true, Some("192.168.10.4"))],
        );
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let err = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation { ref check, ref message }
                if check == "pod-to-pod" && message.contains("192.168.10.4")
        ));
    }

    #[tokio::test]
    async fn no_reachable_peer_pod_is_fatal() {
        let mut mock = cluster_with_peers(
            ok(),
            ok(),
            ok(),
            ok(),
            vec![coredns("coredns-new", true, None)],
        );
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let err = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref check, .. } if check == "pod-to-pod"));
    }

    #[tokio::test]
    async fn pod_that_never_starts_is_still_deleted() {
        let mut mock = MockClusterClient::new();
        mock.expect_run_pod()
            .returning(|_, _, _, _| Err(Error::dependency("run_pod", "image pull backoff")));
        mock.expect_exec_in_pod().never();
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let result = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cleanup_failure_does_not_mask_the_result() {
        let mut mock = cluster(ok(), ok(), ok());
        mock.expect_delete_pod()
            .times(1)
            .returning(|_, _| Err(Error::dependency("delete_pod", "connection reset")));

        let report = NetworkValidator::new(Arc::new(mock), ValidationConfig::default())
            .validate()
            .await
            .unwrap();
        assert!(report.http_reachable);
    }
}
