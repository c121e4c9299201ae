//! # Error Policy
//!
//! Error handling and backoff logic for the controller watch loop.
//! This module handles reconciliation errors and watch stream errors.

use crate::controller::reconciler::{BackoffState, ReconcileError, Reconciler};
use crate::crd::Kustomization;
use crate::observability;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// Delay used when the backoff state cannot be read
const FALLBACK_BACKOFF_SECS: u64 = 60;

/// Key used for per-resource backoff and schedule state
#[must_use]
pub fn resource_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Decide when a failed Kustomization is retried
///
/// - status write failures are retried right away
/// - an invalid `spec.interval` waits for a spec change
/// - everything else follows a per-resource Fibonacci backoff, capped at
///   `spec.interval` for sync failures
pub fn handle_reconciliation_error(
    obj: Arc<Kustomization>,
    error: &ReconcileError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");
    let namespace = obj.metadata.namespace.as_deref().unwrap_or("default");

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = name,
        resource.namespace = namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {}", namespace, name, error);
    observability::metrics::increment_reconciliation_errors(error.kind());

    let key = resource_key(namespace, name);

    if error.awaits_spec_change() {
        info!("Waiting for a spec change before retrying {}", key);
        ctx.schedule.clear(&key);
        observability::metrics::increment_requeues_total("await-change");
        return Action::await_change();
    }

    if error.requeue_immediately() {
        warn!("Status update failed for {}, requeueing immediately", key);
        ctx.schedule.clear(&key);
        observability::metrics::increment_requeues_total("status-retry");
        return Action::requeue(Duration::ZERO);
    }

    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states.entry(key.clone()).or_insert_with(BackoffState::default);
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (FALLBACK_BACKOFF_SECS, 0)
        }
    };

    let mut delay = Duration::from_secs(backoff_seconds);
    if let Some(cap) = error.retry_cap() {
        delay = delay.min(cap);
    }
    ctx.schedule.schedule(&key, delay);

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        "Retrying {} in {}s (error count: {}, next retry at {})",
        key,
        delay.as_secs(),
        error_count,
        next_trigger_time.to_rfc3339()
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(delay)
}

/// How the watch loop should treat a controller stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// RBAC revoked or token expired
    Unauthorized,
    /// Resource version too old, the watch restarts cleanly
    Expired,
    /// API server storage is (re)initializing or throttling
    TooManyRequests,
    /// Watched resource or CRD missing
    NotFound,
    Other,
}

/// Classify a controller stream error by its debug representation
#[must_use]
pub fn classify_watch_error(error_string: &str) -> WatchErrorClass {
    // 404 first: a plain-text 404 body surfaces as a serde error inside WatchFailed
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if is_not_found {
        return WatchErrorClass::NotFound;
    }
    if error_string.contains("401") || error_string.contains("Unauthorized") {
        return WatchErrorClass::Unauthorized;
    }
    if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        return WatchErrorClass::Expired;
    }
    if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        return WatchErrorClass::TooManyRequests;
    }
    WatchErrorClass::Other
}

/// Handle a controller stream error
///
/// Returns `None` to drop the event (the watch restarts) or `Some(())` to keep it.
pub async fn handle_watch_stream_error(error_string: &str, restart_delay: Duration) -> Option<()> {
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );

    async {
        match classify_watch_error(error_string) {
            WatchErrorClass::Unauthorized => {
                error!("Watch authentication failed (401 Unauthorized), RBAC may have been revoked or the token expired");
                error!("Check the ClusterRole and ClusterRoleBinding for the controller ServiceAccount:");
                error!("  kubectl auth can-i watch kustomizations.kustomize.fluxcd.io --all-namespaces --as=system:serviceaccount:<namespace>:kustomize-controller");
                warn!(
                    "Waiting {}s before retrying watch...",
                    restart_delay.as_secs()
                );
                tokio::time::sleep(restart_delay).await;
                None
            }
            WatchErrorClass::Expired => {
                warn!(error_type = "410", "watch.error.resource_version_expired");
                None
            }
            WatchErrorClass::TooManyRequests => {
                warn!(
                    "API server storage reinitializing (429), backing off for {}s before restart...",
                    restart_delay.as_secs()
                );
                tokio::time::sleep(restart_delay).await;
                None
            }
            WatchErrorClass::NotFound => {
                warn!(
                    "Resource not found (404), this is normal for deleted resources or a missing CRD. Error: {}",
                    error_string
                );
                Some(())
            }
            WatchErrorClass::Other => {
                error!("Controller stream error: {}", error_string);
                tokio::time::sleep(restart_delay).await;
                None
            }
        }
    }
    .instrument(error_span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_watch_error() {
        assert_eq!(
            classify_watch_error("ObjectNotFound { name: \"app\" }"),
            WatchErrorClass::NotFound
        );
        assert_eq!(
            classify_watch_error("WatchFailed(Api(ErrorResponse { code: 401, reason: \"Unauthorized\" }))"),
            WatchErrorClass::Unauthorized
        );
        assert_eq!(
            classify_watch_error("too old resource version: 123 (456)"),
            WatchErrorClass::Expired
        );
        assert_eq!(
            classify_watch_error("storage is (re)initializing"),
            WatchErrorClass::TooManyRequests
        );
        assert_eq!(
            classify_watch_error("connection reset by peer"),
            WatchErrorClass::Other
        );
    }

    #[test]
    fn test_not_found_wins_over_watch_failed() {
        assert_eq!(
            classify_watch_error("WatchFailed(SerdeError(invalid type: integer `404`))"),
            WatchErrorClass::NotFound
        );
    }

    #[tokio::test]
    async fn test_expired_restarts_without_delay() {
        let result = handle_watch_stream_error("410 Gone", Duration::from_secs(3600)).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_not_found_keeps_stream() {
        let result = handle_watch_stream_error("ObjectNotFound", Duration::from_secs(3600)).await;
        assert_eq!(result, Some(()));
    }
}
