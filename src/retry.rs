//! Bounded retries for API calls against a young control plane
//!
//! Right after `kind create cluster` the API server drops connections,
//! answers 5xx and races its own controllers (409 on node updates). Those
//! failures are worth another attempt. Authorization and validation failures
//! (401, 403, 404, 422) are not: repeating them only delays the real error.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Classifies an error as worth another attempt
pub trait Transient {
    /// True if the same call may succeed when repeated
    fn is_transient(&self) -> bool;
}

/// Status codes an API server returns while it or its peers are settling
fn transient_status(code: u16) -> bool {
    matches!(code, 409 | 429) || code >= 500
}

impl Transient for kube::Error {
    fn is_transient(&self) -> bool {
        match self {
            kube::Error::Api(resp) => transient_status(resp.code),
            kube::Error::HyperError(_) | kube::Error::Service(_) => true,
            _ => false,
        }
    }
}

impl Transient for Error {
    fn is_transient(&self) -> bool {
        match self {
            Error::Kube { source } => source.is_transient(),
            Error::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| transient_status(s.as_u16()))
            }
            _ => false,
        }
    }
}

/// Backoff policy for one kind of call
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first; always at least one is made
    pub attempts: u32,
    /// Pause after the first failure
    pub initial_delay: Duration,
    /// Pauses never exceed this
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::api_read()
    }
}

impl RetryConfig {
    /// Single reads and updates the convergence loop depends on
    pub fn api_read() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }

    /// API discovery, which lags behind freshly registered CRDs
    pub fn discovery() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }

    /// Nominal pause after the `failures`-th consecutive failure (1-based),
    /// doubling from `initial_delay` up to `max_delay`
    pub fn delay_after(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }
}

/// Run `operation`, repeating it on transient failures.
///
/// Stops at the first success, the first non-transient error, or when
/// `config.attempts` is used up; the error from the last attempt is returned.
/// Each pause is the nominal delay scaled by a random factor in 0.5..1.5.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut failures = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;

        if !err.is_transient() {
            debug!(operation = %operation_name, error = %err, "not retrying permanent failure");
            return Err(err);
        }
        if failures >= config.attempts.max(1) {
            warn!(
                operation = %operation_name,
                attempts = failures,
                error = %err,
                "giving up after transient failures"
            );
            return Err(err);
        }

        let pause = config
            .delay_after(failures)
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        debug!(
            operation = %operation_name,
            attempt = failures,
            error = %err,
            pause_ms = pause.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(pause).await;
    }
}
