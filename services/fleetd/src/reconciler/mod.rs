//! Baseline reconciliation loop.
//!
//! Single-threaded and timer-triggered: each pass reads the desired count
//! from the active source, reads actual state fresh from the compute
//! provider and the job host, cleans up stale instances and orphaned
//! registrations, then converges the live count toward the target. Ticks
//! arriving while a pass runs are coalesced, not queued.

mod ops;
pub mod pressure;

pub(crate) use ops::{FleetOps, PassStats};

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleet_scaling::ScalePlan;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::cloud::CloudInstanceManager;
use crate::config::Config;
use crate::error::ReconcileError;
use crate::fleet::ReconcileRun;
use crate::jobhost::JobHost;
use crate::metrics::FleetMetrics;
use crate::source::DesiredSource;

pub struct Reconciler {
    ops: FleetOps,
    source: DesiredSource,
}

impl Reconciler {
    pub fn new(
        cloud: Arc<dyn CloudInstanceManager>,
        jobhost: Arc<dyn JobHost>,
        source: DesiredSource,
        config: Config,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        Self {
            ops: FleetOps {
                cloud,
                jobhost,
                config,
                metrics,
            },
            source,
        }
    }

    /// Run a single reconciliation pass.
    ///
    /// Idempotent: re-running against unchanged state produces zero
    /// creates and zero deletes.
    #[instrument(skip(self))]
    pub async fn reconcile_pass(&self) -> Result<ReconcileRun, ReconcileError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut stats = PassStats::default();

        let desired = self.source.get(self.ops.config.max_runners).await?;
        let (instances, registrations) = self.ops.observe().await?;

        // Stale cleanup runs before any creation so quota is not consumed
        // by instances about to be cleaned up. Skipped entirely when the
        // registration list was skipped for quota reasons.
        let live = match &registrations {
            Some(registrations) => {
                self.ops
                    .cleanup_stale(&mut stats, instances, registrations)
                    .await
            }
            None => instances,
        };

        let actual_live = live.len() as u32;
        let plan = ScalePlan::compute(desired, actual_live);
        debug!(
            desired,
            actual_live,
            to_create = plan.to_create,
            to_delete = plan.to_delete,
            "Computed scale plan"
        );

        if plan.to_create > 0 {
            self.ops.create_runners(plan.to_create, &mut stats).await;
        }
        if plan.to_delete > 0 {
            // Busy state comes from the registration merge; without it the
            // provider reports a mid-job runner as idle. Never scale down
            // on provider state alone.
            if registrations.is_some() {
                self.ops.delete_excess(live, plan.to_delete, &mut stats).await;
            } else {
                debug!(
                    to_delete = plan.to_delete,
                    "Registration state unknown this pass; deferring scale-down"
                );
            }
        }

        let run = stats.into_run(desired, actual_live, started_at, start.elapsed());
        self.ops.metrics.record_pass(&run);
        Ok(run)
    }

    /// Run the reconcile loop until shutdown.
    ///
    /// Passes are triggered by the interval timer or by a message on the
    /// trigger channel (e.g. a configuration nudge); both funnel into the
    /// same pass so triggers racing a running pass coalesce.
    #[instrument(skip(self, shutdown, trigger))]
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut trigger: mpsc::Receiver<()>,
    ) {
        info!(
            interval_secs = self.ops.config.reconcile_interval.as_secs(),
            source = self.source.kind(),
            "Starting reconciler"
        );

        let mut interval = tokio::time::interval(self.ops.config.reconcile_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                Some(()) = trigger.recv() => {
                    debug!("External reconcile trigger");
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_once(&self) {
        if let Err(e) = self.reconcile_pass().await {
            self.ops.metrics.record_pass_failure();
            error!(error = %e, "Reconcile pass failed");
        }
    }
}
