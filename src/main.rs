//! Kindling - bootstrap a local multi-node Kubernetes cluster

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kindling::bootstrap::Bootstrapper;
use kindling::config::BootstrapConfig;
use kindling::error::CONFIG_EXIT_CODE;
use kindling::Error;

/// Kindling - create a kind cluster, install Calico and wait for it to converge
#[derive(Parser, Debug)]
#[command(name = "kindling", version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; flags below override its values
    #[arg(short = 'f', long = "config", env = "KINDLING_CONFIG")]
    config_file: Option<PathBuf>,

    /// Cluster name
    #[arg(long, env = "KINDLING_CLUSTER_NAME")]
    name: Option<String>,

    /// Number of control-plane nodes
    #[arg(long)]
    control_planes: Option<u32>,

    /// Number of worker nodes
    #[arg(long)]
    workers: Option<u32>,

    /// Calico release to install
    #[arg(long, env = "KINDLING_CNI_VERSION")]
    cni_version: Option<String>,

    /// CNI manifest URL or path (`{version}` is substituted)
    #[arg(long)]
    cni_manifest: Option<String>,

    /// Kubeconfig file to write and use
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Overall node readiness timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Seconds between node readiness samples
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Minimum seconds between stale taint remediation passes
    #[arg(long)]
    remediation_interval_secs: Option<u64>,

    /// Seconds to wait after removing taints before sampling again
    #[arg(long)]
    settle_delay_secs: Option<u64>,

    /// Delete an existing cluster with the same name first
    #[arg(long)]
    recreate: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// File (or defaults) with flag overrides applied, validated
    fn resolve_config(&self) -> Result<BootstrapConfig, Error> {
        let mut config = match &self.config_file {
            Some(path) => BootstrapConfig::from_file(path)?,
            None => BootstrapConfig::default(),
        };

        let cluster = &mut config.cluster;
        override_with(&mut cluster.name, &self.name);
        override_with(&mut cluster.control_planes, &self.control_planes);
        override_with(&mut cluster.workers, &self.workers);
        if self.kubeconfig.is_some() {
            cluster.kubeconfig = self.kubeconfig.clone();
        }
        cluster.recreate |= self.recreate;

        override_with(&mut config.cni.version, &self.cni_version);
        override_with(&mut config.cni.manifest, &self.cni_manifest);

        let readiness = &mut config.readiness;
        override_with(&mut readiness.timeout_secs, &self.timeout_secs);
        override_with(&mut readiness.poll_interval_secs, &self.poll_interval_secs);
        override_with(
            &mut readiness.remediation_interval_secs,
            &self.remediation_interval_secs,
        );
        override_with(&mut readiness.settle_delay_secs, &self.settle_delay_secs);

        config.validate()?;
        Ok(config)
    }
}

fn override_with<T: Clone>(field: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *field = value.clone();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(CONFIG_EXIT_CODE);
        }
    };

    if cli.print_config {
        return match serde_yaml::to_string(&config) {
            Ok(yaml) => {
                print!("{yaml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to render configuration");
                ExitCode::from(CONFIG_EXIT_CODE)
            }
        };
    }

    info!(
        cluster = %config.cluster.name,
        control_planes = config.cluster.control_planes,
        workers = config.cluster.workers,
        cni_version = %config.cni.version,
        "bootstrapping cluster"
    );

    match Bootstrapper::kind(config).run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(failure) => {
            match failure.last_nodes {
                Some((ready, total)) => error!(
                    phase = %failure.phase,
                    error = %failure.source,
                    ready,
                    total,
                    "bootstrap failed"
                ),
                None => error!(phase = %failure.phase, error = %failure.source, "bootstrap failed"),
            }
            ExitCode::from(failure.exit_code())
        }
    }
}
