//! # Resource Store
//!
//! Loads Kustomizations and writes their status. The Kubernetes-backed store
//! patches the status subresource; tests use an in-memory store.

use crate::constants::FIELD_MANAGER;
use crate::crd::{Kustomization, KustomizationStatus};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Load a Kustomization; `Ok(None)` when it no longer exists
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Kustomization>, StoreError>;

    /// Replace the status of a Kustomization
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KustomizationStatus,
    ) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl std::fmt::Debug for KubeResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceStore").finish_non_exhaustive()
    }
}

impl KubeResourceStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Kustomization>, StoreError> {
        let api: Api<Kustomization> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &KustomizationStatus,
    ) -> Result<(), StoreError> {
        let api: Api<Kustomization> = Api::namespaced(self.client.clone(), namespace);
        // Merge patch replaces the conditions list wholesale
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(
            resource.name = name,
            resource.namespace = namespace,
            "status updated"
        );
        Ok(())
    }
}
