//! # Reconcile
//!
//! Entry point invoked per Kustomization key.
//!
//! 1. Load the resource; a missing resource needs no work.
//! 2. Suspended resources get a `Suspended` status and no timer.
//! 3. Resolve the source; unsupported kinds and lookup errors propagate
//!    without touching the status.
//! 4. A source without an artifact gets `ArtifactFailed` and no timer.
//! 5. Otherwise run the sync pipeline on a copy of the resource, persist
//!    whatever draft it produced, and requeue after `spec.interval`.
//!
//! Steps 1-4 share one short deadline. The pipeline has its own budgets.

use crate::controller::reconciler::duration::{format_go_duration, parse_kubernetes_duration};
use crate::controller::reconciler::source::SourceState;
use crate::controller::reconciler::status::{compute_status, ConditionReason, ReadyState};
use crate::controller::reconciler::status::SOURCE_NOT_READY_MESSAGE;
use crate::controller::reconciler::store::StoreError;
use crate::controller::reconciler::types::{ReconcileError, Reconciler};
use crate::controller::sync::Artifact;
use crate::crd::Kustomization;
use crate::observability::metrics;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, Instrument};

/// What the reconciler decided before any sync work
enum Prepared {
    /// The resource is gone
    Gone,
    /// Persist `state` and finish with `outcome`
    Settled {
        kustomization: Box<Kustomization>,
        state: ReadyState,
        outcome: Result<Option<Duration>, ReconcileError>,
    },
    /// Run the sync pipeline
    Sync {
        kustomization: Box<Kustomization>,
        interval: Duration,
        artifact: Artifact,
    },
}

impl Reconciler {
    /// Reconcile one Kustomization
    ///
    /// Returns the delay until the next periodic run, or `None` when only a
    /// future change should trigger one.
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Duration>, ReconcileError> {
        let span = info_span!(
            "kustomization.reconcile",
            resource.name = name,
            resource.namespace = namespace
        );
        async {
            let start = Instant::now();
            metrics::increment_reconciliations();

            let result = self.run(namespace, name).await;

            metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, namespace: &str, name: &str) -> Result<Option<Duration>, ReconcileError> {
        let prepared = tokio::time::timeout(self.reconcile_timeout, self.prepare(namespace, name))
            .await
            .map_err(|_| ReconcileError::Deadline(self.reconcile_timeout))??;

        match prepared {
            Prepared::Gone => Ok(None),
            Prepared::Settled {
                kustomization,
                state,
                outcome,
            } => {
                self.persist(&kustomization, &state, None).await?;
                info!("{}", state.message());
                outcome
            }
            Prepared::Sync {
                kustomization,
                interval,
                artifact,
            } => {
                let outcome = self.pipeline.sync(&kustomization, interval, &artifact).await;
                let revision = outcome
                    .result
                    .as_ref()
                    .ok()
                    .and_then(|report| report.revision.as_deref());
                self.persist(&kustomization, &outcome.state, revision).await?;

                match outcome.result {
                    Ok(_) => {
                        info!(
                            "Kustomization sync finished, next run in {}",
                            format_go_duration(interval)
                        );
                        Ok(Some(interval))
                    }
                    Err(source) => {
                        error!("Kustomization apply failed: {}", source);
                        Err(ReconcileError::Sync { source, interval })
                    }
                }
            }
        }
    }

    async fn prepare(&self, namespace: &str, name: &str) -> Result<Prepared, ReconcileError> {
        let Some(kustomization) = self
            .store
            .get(namespace, name)
            .await
            .map_err(ReconcileError::Load)?
        else {
            debug!("Kustomization not found, nothing to do");
            return Ok(Prepared::Gone);
        };
        let kustomization = Box::new(kustomization);

        if kustomization.spec.suspend {
            return Ok(Prepared::Settled {
                kustomization,
                state: ReadyState::suspended(),
                outcome: Ok(None),
            });
        }

        let interval = match parse_kubernetes_duration(&kustomization.spec.interval) {
            Ok(interval) => interval,
            Err(e) => {
                let state = ReadyState::not_ready(
                    ConditionReason::ValidationFailed,
                    format!("invalid interval '{}': {e}", kustomization.spec.interval),
                );
                return Ok(Prepared::Settled {
                    kustomization,
                    state,
                    outcome: Err(e.into()),
                });
            }
        };

        match self
            .sources
            .resolve(namespace, &kustomization.spec.source_ref)
            .await?
        {
            SourceState::NotReady => Ok(Prepared::Settled {
                kustomization,
                state: ReadyState::not_ready(
                    ConditionReason::ArtifactFailed,
                    SOURCE_NOT_READY_MESSAGE,
                ),
                outcome: Ok(None),
            }),
            SourceState::Ready(artifact) => Ok(Prepared::Sync {
                kustomization,
                interval,
                artifact,
            }),
        }
    }

    /// Write the status computed from `state`, bounded by the reconcile deadline
    async fn persist(
        &self,
        kustomization: &Kustomization,
        state: &ReadyState,
        applied_revision: Option<&str>,
    ) -> Result<(), ReconcileError> {
        let namespace = kustomization.metadata.namespace.as_deref().unwrap_or_default();
        let name = kustomization.metadata.name.as_deref().unwrap_or_default();
        let status = compute_status(
            state,
            kustomization.status.as_ref(),
            kustomization.metadata.generation,
            applied_revision,
            chrono::Utc::now(),
        );

        let write = self.store.update_status(namespace, name, &status);
        match tokio::time::timeout(self.reconcile_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("unable to update Kustomization status: {}", e);
                Err(ReconcileError::PersistStatus(e))
            }
            Err(_) => Err(ReconcileError::PersistStatus(StoreError::Timeout(
                self.reconcile_timeout,
            ))),
        }
    }
}
