//! # Types
//!
//! Core types for the reconciler.

use crate::constants::{ERROR_BACKOFF_MAX_MINUTES, ERROR_BACKOFF_MIN_MINUTES};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::reconciler::duration::DurationError;
use crate::controller::reconciler::schedule::ReconcileSchedule;
use crate::controller::reconciler::source::{SourceError, SourceResolver};
use crate::controller::reconciler::store::{ResourceStore, StoreError};
use crate::controller::sync::{SyncError, SyncPipeline};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to load Kustomization: {0}")]
    Load(#[source] StoreError),
    #[error("reconcile deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("invalid interval: {0}")]
    InvalidInterval(#[from] DurationError),
    #[error("Kustomization apply failed: {source}")]
    Sync {
        #[source]
        source: SyncError,
        /// Parsed `spec.interval`, caps the retry delay
        interval: Duration,
    },
    #[error("unable to update Kustomization status: {0}")]
    PersistStatus(#[source] StoreError),
}

impl ReconcileError {
    /// Status writes are retried right away
    #[must_use]
    pub fn requeue_immediately(&self) -> bool {
        matches!(self, ReconcileError::PersistStatus(_))
    }

    /// Errors only a spec change can fix; no retry timer is set
    #[must_use]
    pub fn awaits_spec_change(&self) -> bool {
        matches!(self, ReconcileError::InvalidInterval(_))
    }

    /// Upper bound for the retry delay, if any
    #[must_use]
    pub fn retry_cap(&self) -> Option<Duration> {
        match self {
            ReconcileError::Sync { interval, .. } => Some(*interval),
            _ => None,
        }
    }

    /// Metric label
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Load(_) => "load",
            ReconcileError::Deadline(_) => "deadline",
            ReconcileError::Source(_) => "source",
            ReconcileError::InvalidInterval(_) => "invalid_interval",
            ReconcileError::Sync { .. } => "sync",
            ReconcileError::PersistStatus(_) => "persist_status",
        }
    }
}

/// Backoff state for a specific resource
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::new(ERROR_BACKOFF_MIN_MINUTES, ERROR_BACKOFF_MAX_MINUTES),
            error_count: 0,
        }
    }
}

impl BackoffState {
    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Shared reconciler context handed to every reconcile call
pub struct Reconciler {
    pub(crate) store: Arc<dyn ResourceStore>,
    pub(crate) sources: Arc<dyn SourceResolver>,
    pub(crate) pipeline: SyncPipeline,
    pub(crate) reconcile_timeout: Duration,
    /// Backoff state per resource (`namespace/name`), driven by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    /// Next due time per resource (`namespace/name`)
    pub schedule: Arc<ReconcileSchedule>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("pipeline", &self.pipeline)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn ResourceStore>,
        sources: Arc<dyn SourceResolver>,
        pipeline: SyncPipeline,
        reconcile_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sources,
            pipeline,
            reconcile_timeout,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            schedule: Arc::new(ReconcileSchedule::default()),
        }
    }

    /// Forget accumulated backoff after a successful reconcile
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
