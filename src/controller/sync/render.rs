//! # Render
//!
//! Confirms the build path exists inside the unpacked artifact and runs
//! `kustomize build <path>`, writing stdout to `<name>.yaml` at the
//! workspace root.

use crate::controller::exec::{CommandExecutor, CommandRequest};
use crate::controller::sync::error::exec_failure_detail;
use crate::controller::sync::SyncError;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Manifest file name for a Kustomization
#[must_use]
pub fn manifest_file_name(name: &str) -> String {
    format!("{name}.yaml")
}

/// Resolve `build_path` under `workspace`, failing when it is missing
///
/// Paths that climb out of the workspace are treated as missing.
pub async fn check_build_path(workspace: &Path, build_path: &str) -> Result<PathBuf, SyncError> {
    let relative = Path::new(build_path);
    let escapes = relative
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    let resolved = workspace.join(relative);

    if escapes || !tokio::fs::try_exists(&resolved).await.unwrap_or(false) {
        return Err(SyncError::PathNotFound {
            path: build_path.to_string(),
        });
    }
    Ok(resolved)
}

/// Run the templating tool and write its stdout to the manifest file
pub async fn build(
    executor: &dyn CommandExecutor,
    kustomize_bin: &str,
    workspace: &Path,
    build_path: &str,
    resource_name: &str,
    timeout: Duration,
) -> Result<PathBuf, SyncError> {
    let request = CommandRequest::new(kustomize_bin, workspace, timeout).args(["build", build_path]);
    debug!(command = %request.command_line(), "rendering manifests");

    let start = Instant::now();
    let output = executor
        .run(&request)
        .await
        .map_err(|e| SyncError::Build {
            output: exec_failure_detail(&e),
        })?;
    if !output.success() {
        return Err(SyncError::Build {
            output: output.combined.trim().to_string(),
        });
    }

    let manifest = workspace.join(manifest_file_name(resource_name));
    tokio::fs::write(&manifest, output.stdout.as_bytes())
        .await
        .map_err(|e| SyncError::Build {
            output: format!("failed to write {}: {e}", manifest.display()),
        })?;

    info!(
        duration_ms = start.elapsed().as_millis() as u64,
        manifest = %manifest.display(),
        "kustomize build completed"
    );
    Ok(manifest)
}
