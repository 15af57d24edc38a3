mod bidder;
mod capacity;
mod cloud;
mod config;
mod diff;
mod error;
mod events;
mod http;
mod in_flight;
mod keypair;
mod pending;
mod pricing;
mod queue;
mod reconciler;
mod safety;
mod snapshot;
mod tags;
mod worker_type;

use clap::Parser;
use cloud::ec2::Ec2Adapter;
use config::{Args, ProvisionerConfig};
use events::{EventSink, TracingEventSink};
use eyre::{eyre, Result};
use fs2::FileExt;
use pricing::NoPricingHistory;
use queue::{NoQueueConfigured, TaskQueue};
use reconciler::ReconcilerState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use worker_type::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = ProvisionerConfig::from_args(&args)?;

    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|e| eyre!("another instance already holds {}: {e}", cfg.lock_file.display()))?;
    let _lock_guard = lock_file;

    let adapter = Ec2Adapter::new();
    let store: Box<dyn Store> = match &args.store_endpoint {
        Some(url) => Box::new(http::HttpStore::new(url.clone())),
        None => return Err(eyre!("--store-endpoint is required")),
    };
    let queue: Box<dyn TaskQueue> = match &args.queue_endpoint {
        Some(url) => Box::new(http::HttpQueue::new(url.clone())),
        None => {
            tracing::warn!("no --queue-endpoint given; every worker-type will report zero pending tasks");
            Box::new(NoQueueConfigured)
        }
    };
    let sink: Box<dyn EventSink> = match &args.telemetry_endpoint {
        Some(url) => Box::new(http::HttpEventSink::new(url.clone())),
        None => Box::new(TracingEventSink),
    };
    let pricing = NoPricingHistory;

    let mut state = ReconcilerState::new();

    // `shutdown_requested` is the synchronous check run after each iteration
    // completes; `shutdown_notify` is what the sleep select races against so
    // a signal arriving mid-sleep doesn't wait out the rest of the interval.
    // The signal listener is spawned once and outlives every iteration, so a
    // signal arriving mid-iteration is recorded but never cancels it (spec
    // section 4.7: the current iteration always finishes before the loop
    // exits).
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());
    tokio::spawn(listen_for_shutdown(shutdown_requested.clone(), shutdown_notify.clone()));

    loop {
        // Spec section 5's hard deadline: an iteration that overruns
        // `iteration_interval` is cancelled at whatever point it's reached,
        // and the next tick starts fresh rather than piling up behind it.
        match tokio::time::timeout(
            cfg.iteration_interval,
            reconciler::run_iteration(&adapter, &*store, &*queue, &pricing, &*sink, &cfg, &mut state),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "aborting: unrecoverable error");
                return Err(eyre!(e));
            }
            Err(_elapsed) => {
                tracing::warn!(
                    iteration_interval_ms = cfg.iteration_interval.as_millis() as u64,
                    "iteration exceeded its hard deadline; cancelling outstanding work and proceeding to the next tick"
                );
            }
        }

        if cfg.once {
            break;
        }
        if shutdown_requested.load(Ordering::SeqCst) {
            tracing::info!("shutdown signal received; current iteration finished, exiting");
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.iteration_interval) => {}
            _ = shutdown_notify.notified() => {
                tracing::info!("shutdown signal received during sleep; exiting");
                break;
            }
        }
    }

    Ok(())
}

/// Waits for `SIGTERM` or `SIGINT`/Ctrl-C, whichever comes first, then
/// records it and wakes anything waiting on `notify`. The teacher's own loop
/// has no such hook; this is added so an operator restart or a container
/// orchestrator's stop signal ends the loop after the current iteration
/// instead of cutting one off mid-bid.
async fn listen_for_shutdown(requested: Arc<AtomicBool>, notify: Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = ctrl_c.await;
                requested.store(true, Ordering::SeqCst);
                notify.notify_waiters();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    requested.store(true, Ordering::SeqCst);
    notify.notify_waiters();
}
