//! # Artifact Retrieval
//!
//! Downloads the source artifact (a gzipped tarball served by the source
//! controller) into the workspace and unpacks it, dropping the single
//! top-level directory every entry is wrapped in.

use crate::controller::sync::SyncError;
use crate::observability::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

/// Downloadable bundle exposed by a ready source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub url: String,
    pub revision: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("artifact download `{url}` error: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("artifact download `{url}` returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("partial download: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("downloaded artifact `{url}` is empty")]
    Empty { url: String },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),
    #[error("artifact task failed: {0}")]
    Task(String),
}

impl ArtifactError {
    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| ArtifactError::Io { context, source }
    }
}

/// Fetches an artifact and unpacks it into a directory
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, artifact: &Artifact, destination: &Path) -> Result<(), ArtifactError>;
}

/// [`ArtifactFetcher`] that downloads over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new() -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ArtifactError::Client)?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str, target: &Path) -> Result<u64, ArtifactError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ArtifactError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ArtifactError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let expected_size = response.content_length();
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(ArtifactError::io(format!("failed to create {}", target.display())))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ArtifactError::Request {
                url: url.to_string(),
                source,
            })?;
            downloaded += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(ArtifactError::io("failed to write artifact"))?;
        }
        file.flush()
            .await
            .map_err(ArtifactError::io("failed to flush artifact"))?;

        if let Some(expected) = expected_size {
            if downloaded != expected {
                return Err(ArtifactError::SizeMismatch {
                    expected,
                    actual: downloaded,
                });
            }
        }
        if downloaded == 0 {
            return Err(ArtifactError::Empty {
                url: url.to_string(),
            });
        }
        Ok(downloaded)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, artifact: &Artifact, destination: &Path) -> Result<(), ArtifactError> {
        let span = info_span!(
            "artifact.fetch",
            artifact.url = artifact.url.as_str(),
            artifact.revision = artifact.revision.as_deref().unwrap_or("unknown"),
            artifact.size_bytes = tracing::field::Empty,
        );
        let start = Instant::now();
        metrics::increment_artifact_downloads_total();

        let result = async {
            // Scratch archive lives inside the workspace and is removed on drop
            let scratch = tempfile::Builder::new()
                .prefix(".artifact-")
                .suffix(".tar.gz")
                .tempfile_in(destination)
                .map_err(ArtifactError::io("failed to create scratch file"))?;

            info!("Downloading artifact from {}", artifact.url);
            let size = self.download(&artifact.url, scratch.path()).await?;
            tracing::Span::current().record("artifact.size_bytes", size);

            let archive = scratch.path().to_path_buf();
            let expected = artifact.checksum.clone();
            let destination = destination.to_path_buf();
            tokio::task::spawn_blocking(move || {
                if let Some(expected) = expected.as_deref() {
                    verify_checksum(&archive, expected)?;
                }
                extract_tar_gz(&archive, &destination)
            })
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

            drop(scratch);
            Ok(())
        }
        .instrument(span)
        .await;

        match &result {
            Ok(()) => metrics::observe_artifact_download_duration(start.elapsed().as_secs_f64()),
            Err(_) => metrics::increment_artifact_download_errors_total(),
        }
        result
    }
}

/// Verify a SHA-256 checksum (`sha256:<hex>` or bare 64-char hex)
///
/// Other checksum formats are not verified.
pub fn verify_checksum(file: &Path, expected: &str) -> Result<(), ArtifactError> {
    let expected = expected.trim();
    let Some(expected_hex) = sha256_hex(expected) else {
        debug!("Skipping verification of non-sha256 checksum {}", expected);
        return Ok(());
    };

    let mut reader = std::fs::File::open(file)
        .map_err(ArtifactError::io("failed to open artifact for checksum verification"))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(ArtifactError::io("failed to read artifact"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected_hex) {
        return Err(ArtifactError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: format!("sha256:{actual}"),
        });
    }
    debug!("Checksum verified: {}", expected);
    Ok(())
}

fn sha256_hex(checksum: &str) -> Option<&str> {
    let hex = checksum.strip_prefix("sha256:").unwrap_or(checksum);
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

/// Unpack a `.tar.gz` into `destination`, stripping the first path component
///
/// Entries that are only the wrapper directory are skipped. Hard link targets
/// are stripped the same way as entry paths. Symlink targets are resolved
/// against the link's own directory and may climb with leading `..` as long
/// as they stay inside `destination`. Nothing is written below a directory
/// that is itself a symlink.
pub fn extract_tar_gz(archive: &Path, destination: &Path) -> Result<(), ArtifactError> {
    let file = std::fs::File::open(archive)
        .map_err(ArtifactError::io(format!("failed to open {}", archive.display())))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(ArtifactError::io("failed to read archive"))?;

    let mut extracted = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(ArtifactError::io("failed to read archive entry"))?;
        let entry_path = entry
            .path()
            .map_err(ArtifactError::io("invalid entry path"))?
            .into_owned();
        let Some(relative) = strip_first_component(&entry_path)? else {
            continue;
        };

        ensure_no_symlink_parents(destination, &relative)?;
        let target = destination.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(ArtifactError::io(format!("failed to create {}", parent.display())))?;
        }

        let entry_type = entry.header().entry_type();
        let link = entry
            .link_name()
            .map_err(ArtifactError::io("invalid link name"))?
            .map(std::borrow::Cow::into_owned);
        match (entry_type, link) {
            (tar::EntryType::Link, Some(link)) => {
                let source = strip_first_component(&link)?
                    .ok_or_else(|| ArtifactError::UnsafePath(link.display().to_string()))?;
                ensure_no_symlink_parents(destination, &source)?;
                std::fs::hard_link(destination.join(&source), &target).map_err(
                    ArtifactError::io(format!(
                        "failed to link {} to {}",
                        relative.display(),
                        source.display()
                    )),
                )?;
            }
            (tar::EntryType::Symlink, Some(link)) => {
                if resolve_symlink(&relative, &link).is_none() {
                    return Err(ArtifactError::UnsafePath(link.display().to_string()));
                }
                entry
                    .unpack(&target)
                    .map_err(ArtifactError::io(format!("failed to unpack {}", relative.display())))?;
            }
            _ => {
                entry
                    .unpack(&target)
                    .map_err(ArtifactError::io(format!("failed to unpack {}", relative.display())))?;
            }
        }
        extracted += 1;
    }

    if extracted == 0 {
        warn!("Artifact archive contained no entries below its top-level directory");
    }
    debug!(entries = extracted, "artifact extracted");
    Ok(())
}

fn strip_first_component(path: &Path) -> Result<Option<PathBuf>, ArtifactError> {
    if !is_contained(path) {
        return Err(ArtifactError::UnsafePath(path.display().to_string()));
    }
    let mut normals = path.components().filter_map(|component| match component {
        Component::Normal(part) => Some(part),
        _ => None,
    });
    normals.next();
    let stripped: PathBuf = normals.collect();
    Ok((!stripped.as_os_str().is_empty()).then_some(stripped))
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Where a symlink at `link_path` pointing to `target` lands, relative to the
/// extraction root
///
/// `None` when the target is absolute, leaves the root, or uses `..` after a
/// named component.
fn resolve_symlink(link_path: &Path, target: &Path) -> Option<PathBuf> {
    let mut resolved: Vec<&std::ffi::OsStr> = link_path
        .parent()
        .into_iter()
        .flat_map(Path::components)
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    let mut descending = false;
    for component in target.components() {
        match component {
            Component::Normal(part) => {
                descending = true;
                resolved.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir if descending => return None,
            Component::ParentDir => {
                resolved.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved.into_iter().collect())
}

/// Reject `relative` when one of its parent directories under `root` is a symlink
fn ensure_no_symlink_parents(root: &Path, relative: &Path) -> Result<(), ArtifactError> {
    let mut current = root.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    for component in parent.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(ArtifactError::UnsafePath(relative.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ArtifactError::Io {
                    context: format!("failed to inspect {}", current.display()),
                    source: e,
                })
            }
        }
    }
    Ok(())
}

/// Fetch stage: download and unpack, bounded by `timeout`
pub async fn retrieve(
    fetcher: &dyn ArtifactFetcher,
    artifact: &Artifact,
    workspace: &Path,
    timeout: Duration,
) -> Result<(), SyncError> {
    match tokio::time::timeout(timeout, fetcher.fetch(artifact, workspace)).await {
        Ok(result) => result.map_err(SyncError::from),
        Err(_) => Err(SyncError::ArtifactTimeout(timeout)),
    }
}
