//! # Status Condition Computer
//!
//! The reconciler works with a [`ReadyState`] draft and only collapses it into
//! the persisted `Ready` condition at the persistence boundary. The status is
//! rebuilt from scratch each time; only `lastAppliedRevision` and the
//! transition timestamp are carried over from the previous status.

use crate::constants::MAX_CONDITION_OUTPUT_BYTES;
use crate::crd::{Condition, KustomizationStatus, READY_CONDITION};
use chrono::{DateTime, Utc};
use std::fmt;

/// Message persisted for a suspended Kustomization
pub const SUSPENDED_MESSAGE: &str = "Kustomization is suspended, skipping reconciliation";
/// Message persisted when the source has no artifact yet
pub const SOURCE_NOT_READY_MESSAGE: &str = "Source is not ready";
/// Message persisted after a successful sync
pub const APPLY_SUCCEEDED_MESSAGE: &str = "kustomization was successfully applied";

/// Typed reason carried by the `Ready` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    Suspended,
    ArtifactFailed,
    BuildFailed,
    ValidationFailed,
    ApplyFailed,
    ApplySucceed,
    StorageOperationFailed,
}

impl ConditionReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::Suspended => "Suspended",
            ConditionReason::ArtifactFailed => "ArtifactFailed",
            ConditionReason::BuildFailed => "BuildFailed",
            ConditionReason::ValidationFailed => "ValidationFailed",
            ConditionReason::ApplyFailed => "ApplyFailed",
            ConditionReason::ApplySucceed => "ApplySucceed",
            ConditionReason::StorageOperationFailed => "StorageOperationFailed",
        }
    }
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness draft produced by the reconciler and the sync pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Suspended {
        message: String,
    },
    NotReady {
        reason: ConditionReason,
        message: String,
    },
    Ready {
        reason: ConditionReason,
        message: String,
    },
}

impl ReadyState {
    #[must_use]
    pub fn suspended() -> Self {
        ReadyState::Suspended {
            message: SUSPENDED_MESSAGE.to_string(),
        }
    }

    /// Failure draft; long tool output is cut down to fit in a condition
    #[must_use]
    pub fn not_ready(reason: ConditionReason, message: impl Into<String>) -> Self {
        ReadyState::NotReady {
            reason,
            message: truncate_message(message.into()),
        }
    }

    #[must_use]
    pub fn ready() -> Self {
        ReadyState::Ready {
            reason: ConditionReason::ApplySucceed,
            message: APPLY_SUCCEEDED_MESSAGE.to_string(),
        }
    }

    #[must_use]
    pub fn reason(&self) -> ConditionReason {
        match self {
            ReadyState::Suspended { .. } => ConditionReason::Suspended,
            ReadyState::NotReady { reason, .. } | ReadyState::Ready { reason, .. } => *reason,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            ReadyState::Suspended { message }
            | ReadyState::NotReady { message, .. }
            | ReadyState::Ready { message, .. } => message,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadyState::Ready { .. })
    }

    /// Condition `status` field: `True` only for [`ReadyState::Ready`]
    #[must_use]
    pub fn condition_status(&self) -> &'static str {
        if self.is_ready() {
            "True"
        } else {
            "False"
        }
    }

    /// Collapse into the persisted `Ready` condition
    ///
    /// The transition time is kept from `previous` when the boolean status
    /// did not flip.
    #[must_use]
    pub fn to_condition(&self, previous: Option<&Condition>, now: DateTime<Utc>) -> Condition {
        let status = self.condition_status();
        let last_transition_time = previous
            .filter(|condition| condition.status == status)
            .and_then(|condition| condition.last_transition_time.clone())
            .unwrap_or_else(|| now.to_rfc3339());

        Condition {
            r#type: READY_CONDITION.to_string(),
            status: status.to_string(),
            last_transition_time: Some(last_transition_time),
            reason: Some(self.reason().to_string()),
            message: Some(self.message().to_string()),
        }
    }
}

/// Build the full status to persist for `state`
///
/// `applied_revision` is set only after a successful sync; otherwise the
/// previously applied revision is kept.
#[must_use]
pub fn compute_status(
    state: &ReadyState,
    previous: Option<&KustomizationStatus>,
    generation: Option<i64>,
    applied_revision: Option<&str>,
    now: DateTime<Utc>,
) -> KustomizationStatus {
    let previous_ready = previous.and_then(KustomizationStatus::ready_condition);
    let last_applied_revision = match applied_revision {
        Some(revision) if state.is_ready() => Some(revision.to_string()),
        _ => previous.and_then(|status| status.last_applied_revision.clone()),
    };

    KustomizationStatus {
        conditions: vec![state.to_condition(previous_ready, now)],
        observed_generation: generation,
        last_applied_revision,
    }
}

fn truncate_message(message: String) -> String {
    let trimmed = message.trim_end();
    if trimmed.len() <= MAX_CONDITION_OUTPUT_BYTES {
        return trimmed.to_string();
    }
    let mut cut = MAX_CONDITION_OUTPUT_BYTES;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &trimmed[..cut])
}
