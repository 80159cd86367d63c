//! fleetd - runner fleet reconciliation daemon.
//!
//! Keeps a fleet of single-use CI runner instances converged toward a
//! desired count sourced from static configuration, a job queue, or a
//! planner pressure stream, while keeping job-host registrations
//! consistent with the compute provider.

use std::sync::Arc;

use anyhow::Result;
use fleetd::{
    cloud::HttpCloud,
    config::Config,
    jobhost::HttpJobHost,
    metrics::FleetMetrics,
    queue::HttpQueue,
    reconciler::{pressure::PressureReconciler, Reconciler},
    source::DesiredSource,
    stream::HttpPressureStream,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEETD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd");
    info!(
        fleet = %config.fleet_name,
        max_runners = config.max_runners,
        "Configuration loaded"
    );

    let cloud = Arc::new(HttpCloud::new(&config));
    let jobhost = Arc::new(HttpJobHost::new(&config));
    let metrics = Arc::new(FleetMetrics::new());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::new();

    if let Some(planner_url) = &config.planner_url {
        info!(planner_url = %planner_url, "Planner configured; running in pressure mode");

        let stream = Arc::new(HttpPressureStream::new(&config, planner_url));
        let reconciler = Arc::new(PressureReconciler::new(
            cloud,
            jobhost,
            stream,
            config.clone(),
            metrics,
        ));

        worker_handles.push(tokio::spawn({
            let reconciler = reconciler.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move {
                reconciler.run_create_loop(shutdown_rx).await;
            }
        }));
        worker_handles.push(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                reconciler.run_delete_loop(shutdown_rx).await;
            }
        }));
    } else {
        let source = match &config.queue_url {
            Some(queue_url) => {
                info!(queue_url = %queue_url, "Job queue configured; mirroring queue depth");
                DesiredSource::QueueDepth(Arc::new(HttpQueue::new(queue_url, config.api_timeout)))
            }
            None => {
                info!(
                    static_runners = config.static_runners,
                    "No queue or planner configured; using static count"
                );
                DesiredSource::Static(config.static_runners)
            }
        };

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let reconciler = Reconciler::new(cloud, jobhost, source, config.clone(), metrics);

        worker_handles.push(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                reconciler.run(shutdown_rx, trigger_rx).await;
            }
        }));

        // SIGHUP nudges an immediate pass without waiting for the timer.
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                nudge_on_hangup(trigger_tx, shutdown_rx).await;
            }
        });
    }

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    for handle in worker_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Worker did not shut down in time");
        }
    }

    info!("fleetd shutdown complete");
    Ok(())
}

/// Forward SIGHUP to the reconciler's trigger channel.
#[cfg(unix)]
async fn nudge_on_hangup(
    trigger: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received; triggering reconcile pass");
                // A full trigger queue means a pass is already pending.
                let _ = trigger.try_send(());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn nudge_on_hangup(_trigger: mpsc::Sender<()>, _shutdown: watch::Receiver<bool>) {}
