//! # Sync Errors
//!
//! One variant per failing stage; each maps to the reason persisted on the
//! `Ready` condition.

use crate::controller::exec::ExecError;
use crate::controller::lock::LockError;
use crate::controller::reconciler::ConditionReason;
use crate::controller::sync::artifact::ArtifactError;
use crate::controller::workspace::WorkspaceError;
use crate::crd::WorkloadReference;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("tmp dir error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("artifact acquisition failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("artifact acquisition timed out after {0:?}")]
    ArtifactTimeout(Duration),
    #[error("kustomization path not found: {path}")]
    PathNotFound { path: String },
    #[error("kustomize build failed: {output}")]
    Build { output: String },
    #[error("{mode}-side validation failed: {output}")]
    Validation { mode: String, output: String },
    #[error("apply failed: {output}")]
    Apply { output: String },
    #[error("health check failed for {workload}: {output}")]
    HealthCheck {
        workload: WorkloadReference,
        output: String,
    },
}

impl SyncError {
    /// Reason persisted on the `Ready` condition for this failure
    #[must_use]
    pub fn reason(&self) -> ConditionReason {
        match self {
            SyncError::Lock(_) | SyncError::Workspace(_) => ConditionReason::StorageOperationFailed,
            SyncError::Artifact(_) | SyncError::ArtifactTimeout(_) | SyncError::PathNotFound { .. } => {
                ConditionReason::ArtifactFailed
            }
            SyncError::Build { .. } => ConditionReason::BuildFailed,
            SyncError::Validation { .. } => ConditionReason::ValidationFailed,
            SyncError::Apply { .. } | SyncError::HealthCheck { .. } => ConditionReason::ApplyFailed,
        }
    }

    /// Short label of the failing stage, used as a metric label
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Lock(_) => "lock",
            SyncError::Workspace(_) => "workspace",
            SyncError::Artifact(_) | SyncError::ArtifactTimeout(_) => "fetch",
            SyncError::PathNotFound { .. } => "path",
            SyncError::Build { .. } => "render",
            SyncError::Validation { .. } => "validate",
            SyncError::Apply { .. } => "apply",
            SyncError::HealthCheck { .. } => "health",
        }
    }
}

/// Failure detail for a command that never produced an exit code
///
/// Timeouts keep whatever output the tool printed before it was killed.
#[must_use]
pub fn exec_failure_detail(error: &ExecError) -> String {
    let output = error.output().trim();
    if output.is_empty() {
        error.to_string()
    } else {
        format!("{error}: {output}")
    }
}
