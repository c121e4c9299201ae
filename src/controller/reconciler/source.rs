//! # Source Resolution
//!
//! Resolves `spec.sourceRef` to the artifact published by the source
//! controller. Only `GitRepository` sources are supported; they are read as
//! dynamic objects so the source CRD types are not compiled in.

use crate::constants::{GIT_REPOSITORY_KIND, SOURCE_API_GROUP, SOURCE_API_VERSION};
use crate::controller::sync::Artifact;
use crate::crd::{Kustomization, SourceRef};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// What the source currently offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    /// The source exists but has not produced an artifact yet
    NotReady,
    Ready(Artifact),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source `{name}` kind '{kind}' not supported")]
    UnsupportedKind { kind: String, name: String },
    #[error("failed to get {kind} {namespace}/{name}: {source}")]
    Lookup {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `source_ref` in `namespace`
    async fn resolve(&self, namespace: &str, source_ref: &SourceRef) -> Result<SourceState, SourceError>;
}

/// API resource for `source.toolkit.fluxcd.io/v1alpha1` `GitRepository`
#[must_use]
pub fn git_repository_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: SOURCE_API_GROUP.to_string(),
        version: SOURCE_API_VERSION.to_string(),
        kind: GIT_REPOSITORY_KIND.to_string(),
    })
}

/// Artifact from `status.artifact`, or `None` when there is none yet
#[must_use]
pub fn artifact_from_source(source: &DynamicObject) -> Option<Artifact> {
    let artifact = source.data.get("status")?.get("artifact")?;
    let url = artifact
        .get("url")
        .and_then(|url| url.as_str())
        .filter(|url| !url.is_empty())?;
    let text = |field: &str| {
        artifact
            .get(field)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    Some(Artifact {
        url: url.to_string(),
        revision: text("revision"),
        checksum: text("checksum"),
    })
}

/// Whether `kustomization` takes its artifact from the given source object
#[must_use]
pub fn references_source(kustomization: &Kustomization, source: &DynamicObject) -> bool {
    kustomization.spec.source_ref.kind == GIT_REPOSITORY_KIND
        && kustomization.spec.source_ref.name == source.name_any()
        && kustomization.namespace() == source.namespace()
}

#[derive(Clone)]
pub struct KubeSourceResolver {
    client: Client,
}

impl std::fmt::Debug for KubeSourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSourceResolver").finish_non_exhaustive()
    }
}

impl KubeSourceResolver {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceResolver for KubeSourceResolver {
    async fn resolve(&self, namespace: &str, source_ref: &SourceRef) -> Result<SourceState, SourceError> {
        if source_ref.kind != GIT_REPOSITORY_KIND {
            return Err(SourceError::UnsupportedKind {
                kind: source_ref.kind.clone(),
                name: source_ref.name.clone(),
            });
        }

        let span = info_span!(
            "gitrepository.get_artifact",
            gitrepository.name = source_ref.name.as_str(),
            namespace = namespace
        );
        async {
            let resource = git_repository_resource();
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            let repository = api
                .get(&source_ref.name)
                .await
                .map_err(|source| SourceError::Lookup {
                    kind: source_ref.kind.clone(),
                    namespace: namespace.to_string(),
                    name: source_ref.name.clone(),
                    source,
                })?;

            Ok(match artifact_from_source(&repository) {
                Some(artifact) => {
                    debug!(artifact.url = artifact.url.as_str(), "source artifact resolved");
                    SourceState::Ready(artifact)
                }
                None => SourceState::NotReady,
            })
        }
        .instrument(span)
        .await
    }
}
