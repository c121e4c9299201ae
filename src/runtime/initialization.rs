//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, tool discovery and Kubernetes client setup.

use crate::config::ControllerConfig;
use crate::controller::exec::ProcessExecutor;
use crate::controller::lock::LockManager;
use crate::controller::reconciler::{KubeResourceStore, KubeSourceResolver, Reconciler};
use crate::controller::server::{start_server, ServerState};
use crate::controller::sync::{HttpArtifactFetcher, SyncPipeline, SyncSettings};
use crate::controller::workspace::WorkspaceProvisioner;
use crate::observability;
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Default tracing filter when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "kustomize_controller=info";

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// Configuration the controller was started with
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - kustomize / kubectl discovery
/// - Kubernetes client creation
/// - Reconciler setup
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        return Err(anyhow::anyhow!("Failed to install rustls crypto provider"));
    }

    let config = ControllerConfig::from_env();
    init_tracing(&config.log_format);

    info!("Starting Kustomize Controller");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!("Configuration: {:?}", config);

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());
    let server_state_clone = Arc::clone(&server_state);
    let server_port = config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Readiness probes should pass as soon as reconciling starts
    wait_for_server_ready(&server_state, &server_handle, &config).await?;

    check_tool(&config.kustomize_bin);
    check_tool(&config.kubectl_bin);

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let reconciler = Arc::new(build_reconciler(client.clone(), &config)?);

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        config,
    })
}

/// Wire the production seams into a [`Reconciler`]
pub fn build_reconciler(client: Client, config: &ControllerConfig) -> Result<Reconciler> {
    let fetcher = HttpArtifactFetcher::new().context("Failed to build artifact HTTP client")?;
    let pipeline = SyncPipeline::new(
        Arc::new(LockManager::new(config.file_lock_dir())),
        WorkspaceProvisioner::new(config.workspace_root.clone()),
        Arc::new(fetcher),
        Arc::new(ProcessExecutor),
        SyncSettings::from(config),
    );

    Ok(Reconciler::new(
        Arc::new(KubeResourceStore::new(client.clone())),
        Arc::new(KubeSourceResolver::new(client)),
        pipeline,
        config.reconcile_timeout(),
    ))
}

fn init_tracing(log_format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        warn!("Tracing subscriber init returned error (may already be initialized): {}", e);
    }
}

/// Log whether `binary` resolves on `PATH`; a missing tool fails syncs, not startup
fn check_tool(binary: &str) {
    match which::which(binary) {
        Ok(path) => info!("Found {} at {}", binary, path.display()),
        Err(e) => warn!(
            "{} not found ({}), syncs will fail until it is installed",
            binary, e
        ),
    }
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.server_startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.server_poll_interval_ms);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}
