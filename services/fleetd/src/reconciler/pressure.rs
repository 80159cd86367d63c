//! Pressure-driven reconciliation: a create loop fed by the planner's
//! streaming endpoint and an independently timed delete loop.
//!
//! A single combined loop would have to poll fast (multiplying provider
//! and job-host calls) or poll slow (reintroducing scale-up latency). The
//! split reacts to pressure within seconds while listing/cleanup stays
//! bounded by the delete interval.
//!
//! The two loops share exactly two things: the most recent pressure sample
//! and the fleet gate serializing every read-then-mutate critical section.
//! The gate is never held across the stream read or the reconnect sleep,
//! so a stalled planner cannot starve the delete loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleet_scaling::{clamp_desired, ReconnectBackoff, ScalePlan};
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::CloudInstanceManager;
use crate::config::Config;
use crate::error::ReconcileError;
use crate::fleet::{PressureSample, ReconcileRun};
use crate::jobhost::JobHost;
use crate::metrics::FleetMetrics;
use crate::stream::PressureStream;

use super::{FleetOps, PassStats};

pub struct PressureReconciler {
    ops: FleetOps,
    stream: Arc<dyn PressureStream>,

    /// Most recent pressure sample; last write wins.
    last_pressure: Mutex<Option<PressureSample>>,

    /// Serializes read-actual-state-then-mutate sections across loops.
    fleet_gate: Mutex<()>,
}

impl PressureReconciler {
    pub fn new(
        cloud: Arc<dyn CloudInstanceManager>,
        jobhost: Arc<dyn JobHost>,
        stream: Arc<dyn PressureStream>,
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
            stream,
            last_pressure: Mutex::new(None),
            fleet_gate: Mutex::new(()),
        }
    }

    /// Record a pressure sample. Last write wins; older samples are
    /// discarded, not queued.
    pub async fn note_pressure(&self, sample: PressureSample) {
        *self.last_pressure.lock().await = Some(sample);
    }

    /// The last pressure value observed, or the configured fallback before
    /// any sample has arrived.
    pub async fn current_target(&self) -> u32 {
        let last = *self.last_pressure.lock().await;
        let target = match last {
            Some(sample) => i64::from(sample.value),
            None => i64::from(self.ops.config.fallback_runners),
        };
        clamp_desired(target, self.ops.config.max_runners)
    }

    /// Create loop: consume the planner stream and scale up immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run_create_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            fallback_runners = self.ops.config.fallback_runners,
            "Starting pressure create loop"
        );

        let mut backoff = match ReconnectBackoff::new(
            self.ops.config.stream_backoff_base,
            self.ops.config.stream_backoff_cap,
        ) {
            Ok(backoff) => backoff,
            Err(e) => {
                error!(error = %e, "Invalid stream backoff schedule");
                return;
            }
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.stream.connect() => result,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match connected {
                Ok(mut subscription) => {
                    info!("Planner pressure stream connected");
                    loop {
                        tokio::select! {
                            sample = subscription.next_sample() => match sample {
                                Some(Ok(sample)) => {
                                    backoff.reset();
                                    debug!(
                                        pressure = sample.value,
                                        "Pressure sample received"
                                    );
                                    self.note_pressure(sample).await;
                                    self.scale_up_pass(sample.value).await;
                                }
                                Some(Err(e)) => {
                                    warn!(error = %e, "Pressure stream read failed");
                                    break;
                                }
                                None => {
                                    warn!("Pressure stream closed by planner");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    info!("Create loop shutting down");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Planner connect failed");
                }
            }

            // Disconnected: converge toward the fallback count until the
            // stream comes back.
            self.enter_fallback().await;

            let delay = backoff.next_delay() + jitter();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Create loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Delete loop: periodic stale cleanup plus downward convergence
    /// toward the last observed pressure. Never calls the planner.
    #[instrument(skip(self, shutdown))]
    pub async fn run_delete_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.ops.config.delete_interval.as_secs(),
            "Starting pressure delete loop"
        );

        let mut interval = tokio::time::interval(self.ops.config.delete_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.delete_pass().await {
                        self.ops.metrics.record_pass_failure();
                        error!(error = %e, "Delete pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Delete loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Immediate scale-up toward a freshly observed pressure value.
    ///
    /// Create-only: scale-down is the delete loop's job, on its own clock.
    pub async fn scale_up_pass(&self, pressure: u32) {
        let target = clamp_desired(i64::from(pressure), self.ops.config.max_runners);

        let _gate = self.fleet_gate.lock().await;

        let started_at = Utc::now();
        let start = Instant::now();
        let mut stats = PassStats::default();

        let instances = match self.ops.cloud.list().await {
            Ok(instances) => instances,
            Err(e) => {
                self.ops.metrics.record_pass_failure();
                error!(error = %e, "Failed to list instances for scale-up");
                return;
            }
        };

        let actual_live = instances.len() as u32;
        let deficit = target.saturating_sub(actual_live);
        if deficit > 0 {
            info!(pressure = target, actual_live, deficit, "Scaling up on pressure");
            self.ops.create_runners(deficit, &mut stats).await;
        }

        let run = stats.into_run(target, actual_live, started_at, start.elapsed());
        self.ops.metrics.record_pass(&run);
    }

    /// Full convergence pass against the last observed pressure.
    #[instrument(skip(self))]
    pub async fn delete_pass(&self) -> Result<ReconcileRun, ReconcileError> {
        let _gate = self.fleet_gate.lock().await;

        let started_at = Utc::now();
        let start = Instant::now();
        let mut stats = PassStats::default();

        let (instances, registrations) = self.ops.observe().await?;
        let live = match &registrations {
            Some(registrations) => {
                self.ops
                    .cleanup_stale(&mut stats, instances, registrations)
                    .await
            }
            None => instances,
        };

        let target = self.current_target().await;
        let actual_live = live.len() as u32;
        let plan = ScalePlan::compute(target, actual_live);

        // Downward only: a stale reading must not trigger creation here,
        // the create loop re-scales on the next streamed sample.
        if plan.to_delete > 0 {
            // Same rule as the baseline pass: without the registration
            // merge, busy state is unknown, so scale-down waits.
            if registrations.is_some() {
                debug!(
                    target,
                    actual_live,
                    to_delete = plan.to_delete,
                    "Converging down toward last pressure"
                );
                self.ops.delete_excess(live, plan.to_delete, &mut stats).await;
            } else {
                debug!(
                    to_delete = plan.to_delete,
                    "Registration state unknown this pass; deferring scale-down"
                );
            }
        }

        let run = stats.into_run(target, actual_live, started_at, start.elapsed());
        self.ops.metrics.record_pass(&run);
        Ok(run)
    }

    /// Planner unavailable: pin the effective desired count to the
    /// configured fallback and make sure at least that many runners exist.
    async fn enter_fallback(&self) {
        let fallback = self.ops.config.fallback_runners;
        info!(fallback_runners = fallback, "Planner unavailable; using fallback count");

        self.note_pressure(PressureSample {
            value: fallback,
            observed_at: Utc::now(),
        })
        .await;
        self.scale_up_pass(fallback).await;
    }
}

/// Small random delay spread so restarting fleets do not reconnect in
/// lockstep.
fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..250))
}
