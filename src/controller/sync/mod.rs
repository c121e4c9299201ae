//! # Sync Pipeline
//!
//! One sync attempt for one Kustomization:
//!
//! lock -> workspace -> fetch -> check path -> render -> validate (optional)
//! -> apply -> parse output -> health checks
//!
//! Stages run strictly in order and the first failure ends the attempt. The
//! outcome is a [`ReadyState`] draft (what the reconciler persists) plus the
//! typed result. The lock and the workspace are released on every exit path.
//!
//! Budgets: fetch and render are bounded by the configured fetch timeout.
//! Dry-run, apply and each health check get `interval + grace`.

pub mod apply;
pub mod artifact;
pub mod error;
pub mod health;
pub mod render;

pub use apply::{parse_apply_output, ApplyReport};
pub use artifact::{Artifact, ArtifactError, ArtifactFetcher, HttpArtifactFetcher};
pub use error::SyncError;

use crate::config::ControllerConfig;
use crate::controller::exec::CommandExecutor;
use crate::controller::lock::LockManager;
use crate::controller::reconciler::duration::format_go_duration;
use crate::controller::reconciler::ReadyState;
use crate::controller::workspace::WorkspaceProvisioner;
use crate::crd::Kustomization;
use crate::observability::metrics;
use kube::ResourceExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

/// Tool locations and stage budgets
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub kustomize_bin: String,
    pub kubectl_bin: String,
    pub fetch_timeout: Duration,
    pub apply_grace: Duration,
}

impl From<&ControllerConfig> for SyncSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            kustomize_bin: config.kustomize_bin.clone(),
            kubectl_bin: config.kubectl_bin.clone(),
            fetch_timeout: config.fetch_timeout(),
            apply_grace: config.apply_grace(),
        }
    }
}

/// Successful sync
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Revision of the applied artifact
    pub revision: Option<String>,
    pub apply: ApplyReport,
}

/// Final draft plus the typed result of a sync attempt
#[derive(Debug)]
pub struct SyncOutcome {
    pub state: ReadyState,
    pub result: Result<SyncReport, SyncError>,
}

pub struct SyncPipeline {
    locks: Arc<LockManager>,
    workspaces: WorkspaceProvisioner,
    fetcher: Arc<dyn ArtifactFetcher>,
    executor: Arc<dyn CommandExecutor>,
    settings: SyncSettings,
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("workspaces", &self.workspaces)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    #[must_use]
    pub fn new(
        locks: Arc<LockManager>,
        workspaces: WorkspaceProvisioner,
        fetcher: Arc<dyn ArtifactFetcher>,
        executor: Arc<dyn CommandExecutor>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            locks,
            workspaces,
            fetcher,
            executor,
            settings,
        }
    }

    /// Run one sync attempt for `kustomization` against `artifact`
    pub async fn sync(
        &self,
        kustomization: &Kustomization,
        interval: Duration,
        artifact: &Artifact,
    ) -> SyncOutcome {
        let name = kustomization.name_any();
        let namespace = kustomization.namespace().unwrap_or_default();
        let span = info_span!(
            "kustomization.sync",
            resource.name = name.as_str(),
            resource.namespace = namespace.as_str(),
            artifact.revision = artifact.revision.as_deref().unwrap_or("unknown"),
        );

        let result = self
            .execute(kustomization, &name, &namespace, interval, artifact)
            .instrument(span)
            .await;

        let state = match &result {
            Ok(_) => ReadyState::ready(),
            Err(e) => {
                warn!(
                    resource.name = name.as_str(),
                    resource.namespace = namespace.as_str(),
                    stage = e.stage(),
                    reason = %e.reason(),
                    "Kustomization sync failed: {}",
                    e
                );
                metrics::increment_sync_failures(e.reason().as_str());
                ReadyState::not_ready(e.reason(), e.to_string())
            }
        };
        SyncOutcome { state, result }
    }

    async fn execute(
        &self,
        kustomization: &Kustomization,
        name: &str,
        namespace: &str,
        interval: Duration,
        artifact: &Artifact,
    ) -> Result<SyncReport, SyncError> {
        let identity = format!("{name}-{namespace}");
        let _lock = self.locks.acquire(&identity).await?;
        let workspace = self.workspaces.provision(&identity)?;

        let result = self
            .run_stages(kustomization, name, interval, artifact, workspace.path())
            .await;

        if let Err(e) = workspace.release() {
            warn!("failed to remove workspace: {}", e);
        }
        result
    }

    async fn run_stages(
        &self,
        kustomization: &Kustomization,
        name: &str,
        interval: Duration,
        artifact: &Artifact,
        dir: &Path,
    ) -> Result<SyncReport, SyncError> {
        let spec = &kustomization.spec;
        let executor = self.executor.as_ref();
        let settings = &self.settings;

        artifact::retrieve(self.fetcher.as_ref(), artifact, dir, settings.fetch_timeout).await?;
        render::check_build_path(dir, &spec.path).await?;
        render::build(
            executor,
            &settings.kustomize_bin,
            dir,
            &spec.path,
            name,
            settings.fetch_timeout,
        )
        .await?;

        let budget = interval + settings.apply_grace;
        let timeout_flag = format_go_duration(interval);
        let manifest = render::manifest_file_name(name);

        if let Some(mode) = spec.validation_mode() {
            apply::validate(executor, &settings.kubectl_bin, dir, &manifest, mode, budget).await?;
        }

        let report = apply::apply(
            executor,
            &settings.kubectl_bin,
            dir,
            &manifest,
            spec.prune_selector(),
            &timeout_flag,
            budget,
        )
        .await?;
        metrics::observe_apply_duration(report.duration.as_secs_f64());
        info!(
            duration_ms = report.duration.as_millis() as u64,
            output = ?report.objects,
            "Kustomization applied in {}",
            format_go_duration(report.duration)
        );

        health::verify(
            executor,
            &settings.kubectl_bin,
            dir,
            &spec.health_checks,
            &timeout_flag,
            budget,
        )
        .await?;

        Ok(SyncReport {
            revision: artifact.revision.clone(),
            apply: report,
        })
    }
}
