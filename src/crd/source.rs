//! # Source and Workload References
//!
//! References from a Kustomization to its artifact source and to the
//! workloads it health-checks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to the source that produces the artifact
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// Kind of source - currently only "GitRepository" is supported
    /// Defaults to "GitRepository"
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// Name of the source resource
    pub name: String,
}

/// Workload whose rollout status is verified after apply
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    /// Kind of the workload (e.g. "Deployment", "StatefulSet", "DaemonSet")
    pub kind: String,
    /// Name of the workload
    pub name: String,
    /// Namespace of the workload
    pub namespace: String,
}

impl fmt::Display for WorkloadReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Default value for source kind
pub fn default_source_kind() -> String {
    crate::constants::GIT_REPOSITORY_KIND.to_string()
}
