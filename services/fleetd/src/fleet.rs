//! Core fleet data types.
//!
//! These are the records exchanged with the compute provider and the job
//! host, plus the ephemeral per-pass summary handed to metrics. None of
//! them are persisted: every reconcile pass re-reads both sources of truth.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// One compute instance hosting one runner agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInstance {
    /// Provider-assigned instance id.
    pub id: String,

    /// Runner name; correlates the instance to its job-host registration.
    pub name: String,

    pub state: RunnerState,

    pub created_at: DateTime<Utc>,
}

impl RunnerInstance {
    /// Whether the instance has outlived the registration grace period.
    pub fn past_grace(&self, grace: ChronoDuration, now: DateTime<Utc>) -> bool {
        now - self.created_at > grace
    }
}

/// Lifecycle state of a runner instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Created at the provider, agent not yet registered.
    Provisioning,

    /// Registered and waiting for a job.
    Idle,

    /// Executing a job. Never force-deleted.
    Busy,

    /// Shutting down after its single job.
    Stopping,

    /// Instance and registration are out of sync past the grace period.
    Stale,
}

impl RunnerState {
    /// States eligible for scale-down deletion.
    pub fn is_deletable(&self) -> bool {
        matches!(self, Self::Idle | Self::Stale)
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Provider health-check verdict for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unresponsive,
    Unknown,
}

/// What the create path asks the provider for.
///
/// The registration token is short-lived; the instance uses it to
/// self-register with the job host on boot.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSpec {
    pub name: String,
    pub image: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub registration_token: String,
}

/// Generate a unique runner name for a fleet.
///
/// The embedded ULID keeps names collision-free and roughly ordered by
/// creation time.
pub fn runner_name(fleet: &str) -> String {
    format!("{}-{}", fleet, Ulid::new().to_string().to_lowercase())
}

/// A job-host-side runner registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub id: i64,
    pub name: String,
    pub busy: bool,
    pub online: bool,
}

/// Short-lived token a new instance uses to self-register.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A planner demand sample. Last-write-wins: only the newest matters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PressureSample {
    pub value: u32,
    pub observed_at: DateTime<Utc>,
}

/// Summary of one reconciliation pass, handed to the metrics sink.
#[derive(Debug, Clone)]
pub struct ReconcileRun {
    pub desired: u32,
    pub actual: u32,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub removed_registrations: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub errors: u32,
}

impl ReconcileRun {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.removed_registrations.is_empty()
    }
}
