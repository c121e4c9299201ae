//! # Validate and Apply
//!
//! Optional `kubectl apply --dry-run=<mode>` followed by the real apply
//! (`--prune -l <selector>` when pruning is enabled). The apply output is
//! parsed into a per-object outcome map for logging.

use crate::controller::exec::{CommandExecutor, CommandRequest};
use crate::controller::sync::error::exec_failure_detail;
use crate::controller::sync::SyncError;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Object identifier to action verb (`created`, `configured`, `unchanged`, ...)
    pub objects: BTreeMap<String, String>,
    pub duration: Duration,
}

/// Turn kubectl's line-oriented output into object -> verb
///
/// Blank lines and lines with fewer than two whitespace-separated tokens are
/// ignored; on duplicate keys the later line wins.
#[must_use]
pub fn parse_apply_output(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some(object), Some(verb)) => Some((object.to_string(), verb.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// Dry-run the rendered manifest in `mode` (`client`, `server`, ...)
pub async fn validate(
    executor: &dyn CommandExecutor,
    kubectl_bin: &str,
    workspace: &Path,
    manifest: &str,
    mode: &str,
    budget: Duration,
) -> Result<(), SyncError> {
    let request = CommandRequest::new(kubectl_bin, workspace, budget).args([
        "apply".to_string(),
        "-f".to_string(),
        manifest.to_string(),
        format!("--dry-run={mode}"),
    ]);
    debug!(command = %request.command_line(), "validating manifests");

    let output = executor.run(&request).await.map_err(|e| SyncError::Validation {
        mode: mode.to_string(),
        output: exec_failure_detail(&e),
    })?;
    if !output.success() {
        return Err(SyncError::Validation {
            mode: mode.to_string(),
            output: output.combined.trim().to_string(),
        });
    }
    Ok(())
}

/// Apply the rendered manifest
///
/// `timeout_flag` is passed to kubectl as `--timeout`; `budget` bounds the
/// process itself.
pub async fn apply(
    executor: &dyn CommandExecutor,
    kubectl_bin: &str,
    workspace: &Path,
    manifest: &str,
    prune_selector: Option<&str>,
    timeout_flag: &str,
    budget: Duration,
) -> Result<ApplyReport, SyncError> {
    let mut request = CommandRequest::new(kubectl_bin, workspace, budget).args([
        "apply".to_string(),
        "-f".to_string(),
        manifest.to_string(),
        format!("--timeout={timeout_flag}"),
    ]);
    if let Some(selector) = prune_selector {
        request = request.args(["--prune", "-l", selector]);
    }
    debug!(command = %request.command_line(), "applying manifests");

    let start = Instant::now();
    let output = executor.run(&request).await.map_err(|e| SyncError::Apply {
        output: exec_failure_detail(&e),
    })?;
    if !output.success() {
        return Err(SyncError::Apply {
            output: output.combined.trim().to_string(),
        });
    }

    Ok(ApplyReport {
        objects: parse_apply_output(&output.combined),
        duration: start.elapsed(),
    })
}
