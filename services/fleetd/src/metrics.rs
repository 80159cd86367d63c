//! Fleet lifecycle metrics.
//!
//! Cheap atomic counters updated by the reconcilers, plus a structured log
//! line after every pass. An external shipper can scrape `snapshot()`;
//! shipping internals are out of scope here.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::fleet::ReconcileRun;

#[derive(Debug, Default)]
pub struct FleetMetrics {
    created: AtomicU64,
    deleted: AtomicU64,
    create_failures: AtomicU64,
    delete_failures: AtomicU64,
    stale_cleaned: AtomicU64,
    registrations_removed: AtomicU64,
    passes: AtomicU64,
    pass_failures: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub deleted: u64,
    pub create_failures: u64,
    pub delete_failures: u64,
    pub stale_cleaned: u64,
    pub registrations_removed: u64,
    pub passes: u64,
    pub pass_failures: u64,
}

impl FleetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self, count: u64) {
        self.created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, count: u64) {
        self.deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_create_failure(&self) {
        self.create_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete_failure(&self) {
        self.delete_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_cleaned(&self, count: u64) {
        self.stale_cleaned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_registration_removed(&self) {
        self.registrations_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_failure(&self) {
        self.pass_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed pass and emit its summary.
    pub fn record_pass(&self, run: &ReconcileRun) {
        self.passes.fetch_add(1, Ordering::Relaxed);

        info!(
            desired = run.desired,
            actual = run.actual,
            created = run.created.len(),
            deleted = run.deleted.len(),
            registrations_removed = run.removed_registrations.len(),
            errors = run.errors,
            duration_ms = run.duration.as_millis() as u64,
            "Reconcile pass complete"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            delete_failures: self.delete_failures.load(Ordering::Relaxed),
            stale_cleaned: self.stale_cleaned.load(Ordering::Relaxed),
            registrations_removed: self.registrations_removed.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            pass_failures: self.pass_failures.load(Ordering::Relaxed),
        }
    }
}
