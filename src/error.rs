//! Error types for kindling
//!
//! Errors carry the context needed to explain a failed bootstrap: which
//! operation timed out and what the cluster looked like at that point, which
//! API call failed, which network check broke.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for kindling operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Local I/O error (spawning tools, reading files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error while fetching a remote manifest
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A bounded wait ran out of time
    #[error("timed out after {}s waiting for {operation} ({ready}/{total} ready)", .elapsed.as_secs())]
    TimeoutExceeded {
        /// What was being waited on
        operation: String,
        /// Ready count at the last observation
        ready: usize,
        /// Total count at the last observation
        total: usize,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// A cluster API call or external tool failed
    #[error("dependency error [{context}]: {message}")]
    Dependency {
        /// Where the failure happened (e.g. "list_nodes", "kind")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A hard network check failed
    #[error("validation failed [{check}]: {message}")]
    Validation {
        /// Name of the check (dns, ping)
        check: String,
        /// Check output or failure description
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// External command returned a failure status
    #[error("command failed: {message}")]
    CommandFailed {
        /// Description including captured stderr
        message: String,
    },
}

impl Error {
    /// Create a timeout error
    pub fn timeout(
        operation: impl Into<String>,
        ready: usize,
        total: usize,
        elapsed: Duration,
    ) -> Self {
        Self::TimeoutExceeded {
            operation: operation.into(),
            ready,
            total,
            elapsed,
        }
    }

    /// Create a dependency error with context
    pub fn dependency(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a validation error for a named check
    pub fn validation(check: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            check: check.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a command failure
    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
        }
    }

    /// Returns true for a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }
}

/// Bootstrap step, used to name the failing phase and pick the exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Required tools are present
    Prerequisites,
    /// Cluster creation and context switch
    ClusterCreate,
    /// CNI manifest apply and pod wait
    CniWait,
    /// Node readiness convergence
    Readiness,
    /// Diagnostic pod network checks
    NetworkValidation,
    /// Sample deployment and service
    SampleWorkload,
}

impl Phase {
    /// Process exit status for a failure in this phase
    pub fn exit_code(self) -> u8 {
        match self {
            Phase::Prerequisites => 10,
            Phase::ClusterCreate => 11,
            Phase::CniWait => 12,
            Phase::Readiness => 13,
            Phase::NetworkValidation => 14,
            Phase::SampleWorkload => 15,
        }
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Prerequisites => "prerequisites",
            Phase::ClusterCreate => "cluster-create",
            Phase::CniWait => "cni-wait",
            Phase::Readiness => "readiness",
            Phase::NetworkValidation => "network-validation",
            Phase::SampleWorkload => "sample-workload",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit status for configuration errors caught before any phase runs
pub const CONFIG_EXIT_CODE: u8 = 2;

/// A bootstrap step that failed, with the error that stopped it
#[derive(Debug, Error)]
#[error("{phase} failed: {source}")]
pub struct PhaseFailure {
    /// The step that failed
    pub phase: Phase,
    /// Why it failed
    #[source]
    pub source: Error,
    /// Ready and total node counts from the last readiness sample, once the
    /// readiness phase has run
    pub last_nodes: Option<(usize, usize)>,
}

impl PhaseFailure {
    /// Exit status for this failure
    pub fn exit_code(&self) -> u8 {
        self.phase.exit_code()
    }

    /// Attach the last observed node counts
    pub fn with_nodes(mut self, (ready, total): (usize, usize)) -> Self {
        self.last_nodes = Some((ready, total));
        self
    }
}

/// Attaches a bootstrap phase to a fallible step
pub trait PhaseExt<T> {
    /// Tag the error with the phase it happened in
    fn in_phase(self, phase: Phase) -> Result<T, PhaseFailure>;
}

impl<T> PhaseExt<T> for Result<T, Error> {
    fn in_phase(self, phase: Phase) -> Result<T, PhaseFailure> {
        self.map_err(|source| PhaseFailure {
            phase,
            source,
            last_nodes: None,
        })
    }
}
