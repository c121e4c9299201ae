//! # Watch Loop
//!
//! Controller watch loop that monitors Kustomization resources and the
//! GitRepository sources they reference, and triggers reconciliation when
//! changes are detected.

use crate::config::ControllerConfig;
use crate::constants::{MAX_REQUEUE_SECS, SYNC_AT_ANNOTATION};
use crate::controller::reconciler::{
    git_repository_resource, references_source, ReconcileError, Reconciler,
};
use crate::controller::server::ServerState;
use crate::crd::Kustomization;
use crate::runtime::error_policy::{
    handle_reconciliation_error, handle_watch_stream_error, resource_key,
};
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::Client;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{controller, controller::Action, watcher, Controller};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// Run the controller watch loop
///
/// Sets up the kube-runtime controller, handles graceful shutdown and
/// restarts the watch when the stream ends or fails.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config: &ControllerConfig,
) -> Result<(), anyhow::Error> {
    info!("Starting controller watch loop...");

    // Mark the server as not ready on SIGTERM/SIGINT so probes drain traffic
    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if wait_for_shutdown_signal().await.is_err() {
            warn!("Unable to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    let restart_delay = config.watch_restart_delay();
    let concurrency = config.max_concurrent_reconciliations;

    loop {
        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let kustomizations: Api<Kustomization> = Api::all(client.clone());
        let source_resource = git_repository_resource();
        let sources: Api<DynamicObject> = Api::all_with(client.clone(), &source_resource);

        let controller = Controller::new(kustomizations, watcher::Config::default().any_semantic())
            .with_config(controller::Config::default().concurrency(concurrency));

        let store = controller.store();
        let schedule = Arc::clone(&reconciler.schedule);
        let controller_future = controller
            .watches_with(
                sources,
                source_resource,
                watcher::Config::default(),
                move |source: DynamicObject| {
                    store
                        .state()
                        .into_iter()
                        .filter(|kustomization| references_source(kustomization, &source))
                        .map(|kustomization| {
                            let object_ref = ObjectRef::from_obj(kustomization.as_ref());
                            schedule.mark_source_trigger(&resource_key(
                                object_ref.namespace.as_deref().unwrap_or_default(),
                                &object_ref.name,
                            ));
                            object_ref
                        })
                        .collect::<Vec<_>>()
                },
            )
            .shutdown_on_signal()
            .run(
                reconcile_kustomization,
                handle_reconciliation_error,
                Arc::clone(&reconciler),
            )
            .filter_map(move |x| async move {
                match &x {
                    Ok((object_ref, action)) => {
                        debug!(resource = %object_ref, action = ?action, "watch.event.success");
                        Some(x)
                    }
                    Err(e) => {
                        let error_string = format!("{e:?}");
                        handle_watch_stream_error(&error_string, restart_delay)
                            .await
                            .map(|()| x)
                    }
                }
            })
            .for_each(|_| futures::future::ready(()));

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );
        controller_future.instrument(watch_span).await;

        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            restart_delay.as_secs()
        );
        tokio::time::sleep(restart_delay).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Adapter between kube-runtime and [`Reconciler::reconcile`]
///
/// Status writes come back as watch events with an unchanged generation.
/// Those are deferred until the resource is due unless its source changed
/// or a new `syncAt` annotation value asks for an immediate sync.
pub async fn reconcile_kustomization(
    obj: Arc<Kustomization>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcileError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let key = resource_key(&namespace, &name);

    let source_triggered = ctx.schedule.take_source_trigger(&key);
    let sync_requested = ctx
        .schedule
        .observe_sync_request(&key, sync_at_annotation(&obj));
    if is_status_only_event(&obj) && !source_triggered && !sync_requested {
        if let Some(remaining) = ctx.schedule.time_until_due(&key) {
            debug!(
                resource.name = name.as_str(),
                resource.namespace = namespace.as_str(),
                "Skipping reconciliation - spec unchanged and not yet due"
            );
            return Ok(Action::requeue(remaining));
        }
    }

    let result = ctx
        .reconcile(&namespace, &name)
        .await
        .map(|next| next.map(|interval| interval.min(Duration::from_secs(MAX_REQUEUE_SECS))));

    match &result {
        Ok(Some(interval)) => {
            ctx.reset_backoff(&key);
            ctx.schedule.schedule(&key, *interval);
            debug!(resource.name = name.as_str(), requeue_after = ?interval, "watch.event.reconciled");
        }
        Ok(None) => {
            ctx.reset_backoff(&key);
            ctx.schedule.clear(&key);
            debug!(resource.name = name.as_str(), "watch.event.reconciled");
        }
        Err(e) => {
            error!(resource.name = name.as_str(), error = %e, "watch.event.reconciliation_failed");
        }
    }

    result.map(|next| next.map_or_else(Action::await_change, Action::requeue))
}

fn sync_at_annotation(obj: &Kustomization) -> Option<&str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(SYNC_AT_ANNOTATION))
        .map(String::as_str)
}

/// Whether the observed generation already matches the spec
fn is_status_only_event(obj: &Kustomization) -> bool {
    let observed = obj.status.as_ref().and_then(|s| s.observed_generation);
    matches!((obj.metadata.generation, observed), (Some(generation), Some(observed)) if generation == observed)
}
