//! # Workspace Provisioner
//!
//! One fresh directory per sync attempt, created under the configured
//! workspace root with a random suffix so concurrent syncs never collide.
//! [`Workspace::release`] removes it; dropping an unreleased workspace
//! removes it as well.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace under {root}: {source}")]
    Create {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove workspace {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct WorkspaceProvisioner {
    root: PathBuf,
}

impl WorkspaceProvisioner {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create an exclusively owned directory whose name starts with `name_prefix`
    pub fn provision(&self, name_prefix: &str) -> Result<Workspace, WorkspaceError> {
        let create_error = |source| WorkspaceError::Create {
            root: self.root.clone(),
            source,
        };
        std::fs::create_dir_all(&self.root).map_err(create_error)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{name_prefix}-"))
            .tempdir_in(&self.root)
            .map_err(create_error)?;
        let path = dir.path().to_path_buf();
        debug!(workspace.path = %path.display(), "provisioned workspace");
        Ok(Workspace {
            dir: Some(dir),
            path,
        })
    }
}

/// Ephemeral sync directory
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively remove the directory
    pub fn release(mut self) -> Result<(), WorkspaceError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close().map_err(|source| WorkspaceError::Remove {
            path: self.path.clone(),
            source,
        })?;
        debug!(workspace.path = %self.path.display(), "released workspace");
        Ok(())
    }
}
