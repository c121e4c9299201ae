//! # Reconciler
//!
//! Per-Kustomization reconciliation.
//!
//! - `types`: reconciler context, errors, backoff state
//! - `reconcile`: load, suspend check, source resolution, sync, status write
//! - `status`: readiness draft and `Ready` condition computation
//! - `schedule`: next due time per resource, used to skip status-only events
//! - `store`: Kustomization get / status update seam
//! - `source`: source reference to artifact resolution seam
//! - `duration`: `spec.interval` parsing and Go-style formatting

pub mod duration;
mod reconcile;
pub mod schedule;
pub mod source;
pub mod status;
pub mod store;
pub mod types;

pub use duration::{format_go_duration, parse_kubernetes_duration, DurationError};
pub use source::{
    artifact_from_source, git_repository_resource, references_source, KubeSourceResolver,
    SourceError, SourceResolver, SourceState,
};
pub use schedule::ReconcileSchedule;
pub use status::{compute_status, ConditionReason, ReadyState};
pub use store::{KubeResourceStore, ResourceStore, StoreError};
pub use types::{BackoffState, ReconcileError, Reconciler};
