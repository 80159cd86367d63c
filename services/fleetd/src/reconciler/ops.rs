//! Per-item fleet operations shared by the baseline and pressure
//! reconcilers.
//!
//! Everything here works on state read fresh at the start of the pass and
//! isolates failures to the instance that caused them: one bad create or
//! delete is logged and counted, never escalated to aborting the pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::cloud::CloudInstanceManager;
use crate::config::Config;
use crate::error::ReconcileError;
use crate::fleet::{
    runner_name, HealthState, ReconcileRun, Registration, RunnerInstance, RunnerSpec, RunnerState,
};
use crate::jobhost::JobHost;
use crate::metrics::FleetMetrics;

/// Mutating fleet operations bound to one provider + job host pair.
#[derive(Clone)]
pub(crate) struct FleetOps {
    pub cloud: Arc<dyn CloudInstanceManager>,
    pub jobhost: Arc<dyn JobHost>,
    pub config: Config,
    pub metrics: Arc<FleetMetrics>,
}

/// Accumulator for one pass's outcomes.
#[derive(Debug, Default)]
pub(crate) struct PassStats {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub removed_registrations: Vec<String>,
    pub errors: u32,
}

impl PassStats {
    pub fn into_run(
        self,
        desired: u32,
        actual: u32,
        started_at: DateTime<Utc>,
        duration: std::time::Duration,
    ) -> ReconcileRun {
        ReconcileRun {
            desired,
            actual,
            created: self.created,
            deleted: self.deleted,
            removed_registrations: self.removed_registrations,
            started_at,
            duration,
            errors: self.errors,
        }
    }
}

impl FleetOps {
    /// Read actual state from both sources of truth.
    ///
    /// The instance list is mandatory; failing it aborts the pass. The
    /// registration list is skipped (`None`) when the job-host quota has
    /// dropped below the configured floor, so a pass never spends the last
    /// of the budget on bookkeeping.
    pub async fn observe(
        &self,
    ) -> Result<(Vec<RunnerInstance>, Option<Vec<Registration>>), ReconcileError> {
        let instances = self.cloud.list().await?;

        if let Some(remaining) = self.jobhost.remaining_quota() {
            if remaining < self.config.rate_limit_floor {
                warn!(
                    remaining,
                    floor = self.config.rate_limit_floor,
                    "Job host quota low; skipping registration list this pass"
                );
                return Ok((instances, None));
            }
        }

        let registrations = self.jobhost.list_registrations().await?;
        Ok((instances, Some(registrations)))
    }

    /// Stale cleanup: the step that always precedes creation.
    ///
    /// Deletes instances without a registration past the grace period and
    /// unresponsive instances whose registration went offline; removes
    /// registrations that have no instance behind them. Returns the
    /// surviving live instances with registration busy-state merged in.
    pub async fn cleanup_stale(
        &self,
        stats: &mut PassStats,
        instances: Vec<RunnerInstance>,
        registrations: &[Registration],
    ) -> Vec<RunnerInstance> {
        let now = Utc::now();
        let grace = self.config.registration_grace_chrono();
        let by_name: HashMap<&str, &Registration> = registrations
            .iter()
            .map(|r| (r.name.as_str(), r))
            .collect();
        let registered_names: HashSet<String> =
            registrations.iter().map(|r| r.name.clone()).collect();

        let (live, stale) = fleet_scaling::split_stale(
            instances,
            &registered_names,
            grace,
            now,
            |i| i.name.as_str(),
            |i| i.created_at,
        );

        // Registered but offline instances past the grace period get a
        // health probe; unresponsive ones join the stale set.
        let mut survivors = Vec::with_capacity(live.len());
        let mut stale = stale;
        for mut instance in live {
            if let Some(registration) = by_name.get(instance.name.as_str()) {
                if !registration.online && instance.past_grace(grace, now) {
                    match self.cloud.health_check(&instance.id).await {
                        Ok(HealthState::Unresponsive) => {
                            instance.state = RunnerState::Stale;
                            stale.push(instance);
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(
                                instance_id = %instance.id,
                                error = %e,
                                "Health check failed; keeping instance"
                            );
                        }
                    }
                }
                instance.state = if registration.busy {
                    RunnerState::Busy
                } else if instance.state == RunnerState::Provisioning && registration.online {
                    RunnerState::Idle
                } else {
                    instance.state
                };
            }
            survivors.push(instance);
        }

        for instance in &stale {
            match self.cloud.delete(&instance.id).await {
                Ok(()) => {
                    warn!(
                        instance_id = %instance.id,
                        runner = %instance.name,
                        "Deleted stale instance"
                    );
                    self.metrics.record_stale_cleaned(1);
                    self.metrics.record_deleted(1);
                    stats.deleted.push(instance.name.clone());
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        error = %e,
                        "Failed to delete stale instance"
                    );
                    self.metrics.record_delete_failure();
                    stats.errors += 1;
                }
            }
        }

        let instance_names: HashSet<String> =
            survivors.iter().map(|i| i.name.clone()).collect();
        let orphans = fleet_scaling::orphaned_registrations(
            registrations.iter().map(|r| r.name.as_str()),
            &instance_names,
        );

        for name in orphans {
            match self.jobhost.remove_registration(name).await {
                Ok(()) => {
                    debug!(runner = %name, "Removed orphaned registration");
                    self.metrics.record_registration_removed();
                    stats.removed_registrations.push(name.to_string());
                }
                Err(e) if e.is_already_clean() => {
                    stats.removed_registrations.push(name.to_string());
                }
                Err(crate::error::JobHostError::RateLimited { retry_after }) => {
                    // Back off: leave the rest for a later pass.
                    warn!(
                        runner = %name,
                        retry_after_secs = retry_after.map(|d| d.as_secs()),
                        "Registration removal rate limited; deferring remainder"
                    );
                    stats.errors += 1;
                    break;
                }
                Err(e) => {
                    warn!(runner = %name, error = %e, "Failed to remove registration");
                    stats.errors += 1;
                }
            }
        }

        survivors
    }

    /// Create `count` instances, each with a fresh registration token.
    ///
    /// Best-effort: partial success is not rolled back. A token-issuance
    /// failure stops further creates for this pass since no instance can
    /// register without one.
    pub async fn create_runners(&self, count: u32, stats: &mut PassStats) {
        for _ in 0..count {
            let token = match self.jobhost.create_registration_token().await {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "Failed to issue registration token; deferring creates");
                    self.metrics.record_create_failure();
                    stats.errors += 1;
                    break;
                }
            };

            let spec = RunnerSpec {
                name: runner_name(&self.config.fleet_name),
                image: self.config.runner_image.clone(),
                cpu_cores: self.config.runner_cpu_cores,
                memory_mb: self.config.runner_memory_mb,
                registration_token: token.token,
            };

            match self.cloud.create(&spec).await {
                Ok(instance) => {
                    debug!(
                        instance_id = %instance.id,
                        runner = %instance.name,
                        "Created runner instance"
                    );
                    self.metrics.record_created(1);
                    stats.created.push(instance.name);
                }
                Err(e) => {
                    warn!(runner = %spec.name, error = %e, "Failed to create runner instance");
                    self.metrics.record_create_failure();
                    stats.errors += 1;
                }
            }
        }
    }

    /// Delete up to `excess` of the oldest idle instances.
    ///
    /// Busy instances are never selected; a shortfall of deletable
    /// instances is left for a later pass.
    pub async fn delete_excess(
        &self,
        live: Vec<RunnerInstance>,
        excess: u32,
        stats: &mut PassStats,
    ) {
        let victims = fleet_scaling::select_for_deletion(
            live,
            excess as usize,
            |i| i.state.is_deletable(),
            |i| i.created_at,
        );

        // Once the job host rate-limits, no further removal calls this
        // pass; the next pass's orphan sweep catches up.
        let mut deregister = true;

        for instance in victims {
            match self.cloud.delete(&instance.id).await {
                Ok(()) => {
                    debug!(
                        instance_id = %instance.id,
                        runner = %instance.name,
                        "Deleted excess instance"
                    );
                    self.metrics.record_deleted(1);
                    stats.deleted.push(instance.name.clone());

                    if !deregister {
                        continue;
                    }

                    // Keep the job host consistent right away instead of
                    // waiting for the next pass's orphan sweep.
                    match self.jobhost.remove_registration(&instance.name).await {
                        Ok(()) => {
                            self.metrics.record_registration_removed();
                            stats.removed_registrations.push(instance.name.clone());
                        }
                        Err(e) if e.is_already_clean() => {}
                        Err(crate::error::JobHostError::RateLimited { retry_after }) => {
                            warn!(
                                runner = %instance.name,
                                retry_after_secs = retry_after.map(|d| d.as_secs()),
                                "Deregistration rate limited; deferring remainder"
                            );
                            stats.errors += 1;
                            deregister = false;
                        }
                        Err(e) => {
                            warn!(
                                runner = %instance.name,
                                error = %e,
                                "Failed to deregister deleted instance"
                            );
                            stats.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        error = %e,
                        "Failed to delete excess instance"
                    );
                    self.metrics.record_delete_failure();
                    stats.errors += 1;
                }
            }
        }
    }
}
