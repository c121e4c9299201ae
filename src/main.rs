//! # Kustomize Controller
//!
//! A Kubernetes controller that builds kustomize overlays from GitOps source
//! artifacts and applies them to the cluster on a fixed interval.
//!
//! ## Overview
//!
//! For every `Kustomization` resource the controller:
//! 1. Resolves the referenced `GitRepository` to its latest artifact
//! 2. Downloads and extracts the artifact into a private workspace
//! 3. Runs `kustomize build` on the configured path
//! 4. Optionally validates the manifest with `kubectl apply --dry-run`
//! 5. Applies the manifest, optionally pruning by label selector
//! 6. Waits for the configured workloads to finish rolling out
//! 7. Records the outcome in the `Ready` condition
//!
//! Configuration comes from environment variables, see [`ControllerConfig`].
//!
//! [`ControllerConfig`]: kustomize_controller::config::ControllerConfig

use anyhow::Result;
use kustomize_controller::runtime::{initialize, run_watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    run_watch_loop(
        init.client.clone(),
        init.reconciler.clone(),
        init.server_state.clone(),
        &init.config,
    )
    .await
}
