//! Kindling - local multi-node Kubernetes cluster bootstrapper
//!
//! Kindling creates a kind cluster with the default CNI disabled, installs
//! Calico, and then drives the cluster to a healthy state: it waits for
//! every node to report `Ready`, removes stale `not-ready`/`unreachable`
//! taints on its own cadence, and validates pod networking before deploying
//! a sample workload.
//!
//! # Modules
//!
//! - [`clock`] - Injectable monotonic clock and bounded-operation deadlines
//! - [`client`] - Cluster client interface and its kube-rs implementation
//! - [`manifest`] - Multi-document manifest parsing and server-side apply
//! - [`retry`] - Exponential backoff for transient API failures
//! - [`remediation`] - Stale readiness taint removal
//! - [`readiness`] - Node readiness convergence loop
//! - [`cni`] - CNI manifest install and availability wait
//! - [`validation`] - In-cluster DNS, HTTP and ICMP checks
//! - [`workload`] - Sample deployment and NodePort service
//! - [`provision`] - Prerequisite checks and kind cluster creation
//! - [`bootstrap`] - Phase sequencing
//! - [`config`] - Configuration file model and validation
//! - [`error`] - Error types and exit statuses

#![deny(missing_docs)]

pub mod bootstrap;
pub mod client;
pub mod clock;
pub mod cni;
pub mod config;
pub mod error;
pub mod manifest;
pub mod provision;
pub mod readiness;
pub mod remediation;
pub mod retry;
pub mod validation;
pub mod workload;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
