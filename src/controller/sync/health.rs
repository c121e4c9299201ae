//! # Health Verifier
//!
//! Runs `kubectl -n <ns> rollout status <kind> <name> --timeout=<interval>`
//! for each declared workload, in order, stopping at the first failure.
//! Every check is given the full apply budget.

use crate::controller::exec::{CommandExecutor, CommandRequest};
use crate::controller::sync::error::exec_failure_detail;
use crate::controller::sync::SyncError;
use crate::crd::WorkloadReference;
use crate::observability::metrics;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub async fn verify(
    executor: &dyn CommandExecutor,
    kubectl_bin: &str,
    working_dir: &Path,
    checks: &[WorkloadReference],
    timeout_flag: &str,
    budget: Duration,
) -> Result<(), SyncError> {
    for check in checks {
        let request = CommandRequest::new(kubectl_bin, working_dir, budget).args([
            "-n".to_string(),
            check.namespace.clone(),
            "rollout".to_string(),
            "status".to_string(),
            check.kind.clone(),
            check.name.clone(),
            format!("--timeout={timeout_flag}"),
        ]);

        let failure = match executor.run(&request).await {
            Ok(output) if output.success() => None,
            Ok(output) => Some(output.combined),
            Err(e) => Some(exec_failure_detail(&e)),
        };

        if let Some(output) = failure {
            metrics::increment_health_checks("failed");
            return Err(SyncError::HealthCheck {
                workload: check.clone(),
                output,
            });
        }

        metrics::increment_health_checks("passed");
        info!("health check passed for {}", check);
    }
    Ok(())
}
