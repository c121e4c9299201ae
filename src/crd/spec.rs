//! # Kustomization Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};

/// Kustomization Custom Resource Definition
///
/// Declares a kustomize overlay inside a source artifact that the controller
/// builds and applies to the cluster on every `interval`.
///
/// # Example
///
/// ```yaml
/// apiVersion: kustomize.fluxcd.io/v1alpha1
/// kind: Kustomization
/// metadata:
///   name: podinfo
///   namespace: flux-system
/// spec:
///   interval: 5m
///   path: ./overlays/dev
///   prune: env=dev
///   validation: client
///   sourceRef:
///     kind: GitRepository
///     name: podinfo
///   healthChecks:
///     - kind: Deployment
///       name: podinfo
///       namespace: dev
/// ```
#[derive(kube::CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Kustomization",
    group = "kustomize.fluxcd.io",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::KustomizationStatus",
    shortname = "ks",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Reference to the source that produces the artifact
    /// The source must live in the same namespace as the Kustomization
    pub source_ref: crate::crd::SourceRef,
    /// Path to the directory containing a kustomization.yaml file,
    /// relative to the artifact root
    /// Default: "./"
    #[serde(default = "default_path")]
    pub path: String,
    /// How often the overlay is built and applied
    /// Format: duration string (e.g., "30s", "5m", "1h30m")
    /// Also bounds dry-run, apply and each health check (plus a short grace)
    pub interval: String,
    /// Dry-run mode passed to `kubectl apply --dry-run=<mode>` before the real apply
    /// Values: "client", "server"; empty or absent disables validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<String>,
    /// Label selector used to prune objects that are no longer in the overlay
    /// Example: "env=dev,app=podinfo"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<String>,
    /// Workloads whose rollout must complete before the Kustomization is Ready
    #[serde(default)]
    pub health_checks: Vec<crate::crd::WorkloadReference>,
    /// Suspend reconciliation
    /// When true, the controller skips this resource until the flag is cleared
    /// Default: false
    #[serde(default = "default_false")]
    pub suspend: bool,
}

impl KustomizationSpec {
    /// Dry-run mode, or `None` when validation is disabled
    #[must_use]
    pub fn validation_mode(&self) -> Option<&str> {
        self.validation
            .as_deref()
            .map(str::trim)
            .filter(|mode| !mode.is_empty() && *mode != "none")
    }

    /// Prune label selector, or `None` when pruning is disabled
    #[must_use]
    pub fn prune_selector(&self) -> Option<&str> {
        self.prune
            .as_deref()
            .map(str::trim)
            .filter(|selector| !selector.is_empty())
    }
}

/// Default value for the build path
pub fn default_path() -> String {
    "./".to_string()
}

/// Default value for boolean false
pub fn default_false() -> bool {
    false
}
