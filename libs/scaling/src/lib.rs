//! Convergence helpers for runner-fleet reconciliation.
//!
//! This library holds the pure decision logic shared by the baseline and
//! pressure reconcilers:
//!
//! - **Desired count**: clamping a raw target into the allowed range.
//! - **Scale plan**: how many instances to create or delete in one pass.
//! - **Classification**: which instances are stale and which registrations
//!   are orphaned, given a grace period.
//! - **Deletion selection**: oldest idle instances first, busy never.
//! - **Reconnect backoff**: the schedule for re-dialing a failed stream.
//!
//! # Invariants
//!
//! - All functions are deterministic given the same inputs.
//! - A plan computed against unchanged state is empty (idempotent pass).
//! - Busy instances are never selected for deletion.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from scaling configuration.
#[derive(Debug, Error)]
pub enum ScalingError {
    /// Backoff schedule parameters are inconsistent.
    #[error("invalid backoff schedule: base {base:?} exceeds cap {cap:?}")]
    InvalidBackoff { base: Duration, cap: Duration },
}

/// Clamp a raw desired-count signal into `[0, max]`.
///
/// Sources can report negative or absurdly large values (a miscounting
/// queue, a buggy planner); the fleet target never leaves this range.
pub fn clamp_desired(raw: i64, max: u32) -> u32 {
    if raw <= 0 {
        0
    } else {
        (raw as u64).min(u64::from(max)) as u32
    }
}

/// The create/delete actions for one reconcile pass.
///
/// At most one side is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScalePlan {
    /// Instances to create this pass.
    pub to_create: u32,

    /// Instances to delete this pass.
    pub to_delete: u32,
}

impl ScalePlan {
    /// Compute the plan for converging `actual_live` toward `desired`.
    pub fn compute(desired: u32, actual_live: u32) -> Self {
        Self {
            to_create: desired.saturating_sub(actual_live),
            to_delete: actual_live.saturating_sub(desired),
        }
    }

    /// Returns true if the pass has nothing to do.
    pub fn is_noop(&self) -> bool {
        self.to_create == 0 && self.to_delete == 0
    }
}

/// Split instances into (live, stale) against the registration set.
///
/// An instance is stale when it has no same-name registration and its age
/// exceeds the grace period. Younger unregistered instances are still
/// booting and count as live.
///
/// The closures extract the name and creation time so callers keep their
/// own instance type.
pub fn split_stale<T, N, C>(
    instances: Vec<T>,
    registered_names: &HashSet<String>,
    grace: chrono::Duration,
    now: DateTime<Utc>,
    name: N,
    created_at: C,
) -> (Vec<T>, Vec<T>)
where
    N: Fn(&T) -> &str,
    C: Fn(&T) -> DateTime<Utc>,
{
    let mut live = Vec::new();
    let mut stale = Vec::new();

    for instance in instances {
        let registered = registered_names.contains(name(&instance));
        let past_grace = now - created_at(&instance) > grace;
        if !registered && past_grace {
            stale.push(instance);
        } else {
            live.push(instance);
        }
    }

    (live, stale)
}

/// Registrations with no matching instance name.
///
/// These are leaked job-host records (the instance is gone but never
/// deregistered) and get removed on the next pass.
pub fn orphaned_registrations<'a>(
    registration_names: impl IntoIterator<Item = &'a str>,
    instance_names: &HashSet<String>,
) -> Vec<&'a str> {
    registration_names
        .into_iter()
        .filter(|name| !instance_names.contains(*name))
        .collect()
}

/// Select up to `excess` instances for deletion.
///
/// Only instances the `deletable` closure accepts are considered (idle,
/// never busy or mid-provisioning); candidates are taken oldest first.
/// Returns fewer than `excess` when not enough are deletable.
pub fn select_for_deletion<T, D, C>(
    candidates: Vec<T>,
    excess: usize,
    deletable: D,
    created_at: C,
) -> Vec<T>
where
    D: Fn(&T) -> bool,
    C: Fn(&T) -> DateTime<Utc>,
{
    let mut eligible: Vec<T> = candidates.into_iter().filter(|i| deletable(i)).collect();
    eligible.sort_by_key(|i| created_at(i));
    eligible.truncate(excess);
    eligible
}

/// Exponential backoff schedule for stream reconnects.
///
/// Doubles from `base` up to `cap`; `reset()` on any successful read so a
/// flapping stream does not stay pinned at the cap.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a backoff schedule. Fails if `base` exceeds `cap`.
    pub fn new(base: Duration, cap: Duration) -> Result<Self, ScalingError> {
        if base > cap || base.is_zero() {
            return Err(ScalingError::InvalidBackoff { base, cap });
        }
        Ok(Self {
            base,
            cap,
            attempt: 0,
        })
    }

    /// The delay to wait before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base.saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.cap)
    }

    /// Reset the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
