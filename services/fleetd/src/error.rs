//! Error taxonomy for the fleet daemon.
//!
//! Per-instance failures (one create or delete going wrong) are caught and
//! logged where they happen and never abort the enclosing pass. The types
//! here distinguish the cases callers react to differently: quota
//! exhaustion, rate limiting, and already-clean removals.

use std::time::Duration;

use thiserror::Error;

/// Compute-provider errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The provider rejected or failed a provisioning request.
    /// Retryable on the next pass.
    #[error("provision failed: {0}")]
    Provision(String),

    /// Provider-side quota is exhausted.
    #[error("compute quota exhausted")]
    Quota,

    /// The instance does not exist.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Network-level failure talking to the provider.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider returned a response we could not interpret.
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

/// Job-host registration API errors.
#[derive(Debug, Error)]
pub enum JobHostError {
    /// No registration with that name. Non-fatal: treated as already clean.
    #[error("registration not found: {0}")]
    NotFound(String),

    /// The job host is rate limiting us. Back off; never busy-loop.
    #[error("rate limited by job host (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network-level failure talking to the job host.
    #[error("job host request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The job host returned a response we could not interpret.
    #[error("unexpected job host response: {0}")]
    Protocol(String),
}

impl JobHostError {
    /// Removal failures that mean the registration is already gone.
    pub fn is_already_clean(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Job-queue errors (queue-depth desired-count source).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected queue response: {0}")]
    Protocol(String),
}

/// Planner pressure-stream errors.
///
/// Never fatal: the create loop recovers with fallback count and
/// reconnect backoff.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream connect failed: {0}")]
    Connect(String),

    #[error("stream read failed: {0}")]
    Read(String),
}

/// Pass-level reconciliation errors.
///
/// These abort the current pass only; the next scheduled trigger retries.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Could not read actual instance state from the provider.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Could not read registration state from the job host.
    #[error(transparent)]
    JobHost(#[from] JobHostError),

    /// Could not read the desired count from the active source.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The configured source cannot be pulled synchronously.
    #[error("desired-count source is push-based; no synchronous read")]
    PushOnlySource,
}
