//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// HTTP port for `/metrics`, `/healthz` and `/readyz`
    pub metrics_port: u16,
    /// How long the HTTP server may take to bind before startup fails (seconds)
    pub server_startup_timeout_secs: u64,
    /// Poll interval while waiting for the HTTP server to bind (milliseconds)
    pub server_poll_interval_ms: u64,
    /// Deadline for loading a Kustomization and resolving its source (seconds)
    /// Does not bound the sync pipeline
    pub reconcile_timeout_secs: u64,
    /// Deadline for the artifact download and `kustomize build` (seconds)
    pub fetch_timeout_secs: u64,
    /// Grace added to `spec.interval` to form the apply budget (seconds)
    pub apply_grace_secs: u64,
    /// Path or name of the kustomize binary
    pub kustomize_bin: String,
    /// Path or name of the kubectl binary
    pub kubectl_bin: String,
    /// Directory holding `<name>-<namespace>.lock` files
    pub lock_dir: PathBuf,
    /// Whether sync locks are also backed by `flock` files
    /// Needed when several controller processes share one host
    pub file_locks_enabled: bool,
    /// Parent directory for per-sync workspaces
    pub workspace_root: PathBuf,
    /// Watch stream restart delay after errors or stream end (seconds)
    pub watch_restart_delay_secs: u64,
    /// Log format (json, text)
    pub log_format: String,
    /// Maximum concurrent reconciliations
    pub max_concurrent_reconciliations: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            server_startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            server_poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            apply_grace_secs: DEFAULT_APPLY_GRACE_SECS,
            kustomize_bin: DEFAULT_KUSTOMIZE_BIN.to_string(),
            kubectl_bin: DEFAULT_KUBECTL_BIN.to_string(),
            lock_dir: std::env::temp_dir(),
            file_locks_enabled: true,
            workspace_root: std::env::temp_dir(),
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_format: "text".to_string(),
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    #[must_use]
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            server_startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            server_poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
            reconcile_timeout_secs: env_var_or_default(
                "RECONCILE_TIMEOUT_SECS",
                DEFAULT_RECONCILE_TIMEOUT_SECS,
            ),
            fetch_timeout_secs: env_var_or_default("FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS),
            apply_grace_secs: env_var_or_default("APPLY_GRACE_SECS", DEFAULT_APPLY_GRACE_SECS),
            kustomize_bin: env_var_or_default_str("KUSTOMIZE_BIN", DEFAULT_KUSTOMIZE_BIN),
            kubectl_bin: env_var_or_default_str("KUBECTL_BIN", DEFAULT_KUBECTL_BIN),
            lock_dir: env_var_or_default_path("LOCK_DIR"),
            file_locks_enabled: env_var_or_default_bool("FILE_LOCKS_ENABLED", true),
            workspace_root: env_var_or_default_path("WORKSPACE_ROOT"),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            log_format: env_var_or_default_str("LOG_FORMAT", "text"),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
        }
    }

    /// Get the reconcile deadline
    #[must_use]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Get the fetch/render deadline
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Get the grace added to the apply budget
    #[must_use]
    pub fn apply_grace(&self) -> Duration {
        Duration::from_secs(self.apply_grace_secs)
    }

    /// Get watch restart delay duration
    #[must_use]
    pub fn watch_restart_delay(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Lock directory, or `None` when file-backed locks are disabled
    #[must_use]
    pub fn file_lock_dir(&self) -> Option<PathBuf> {
        self.file_locks_enabled.then(|| self.lock_dir.clone())
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Read environment variable as a path, falling back to the system temp dir
fn env_var_or_default_path(key: &str) -> PathBuf {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map_or_else(std::env::temp_dir, PathBuf::from)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
