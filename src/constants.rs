//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable (see [`crate::config::ControllerConfig`]).

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Fixed deadline for loading the resource and resolving its source (seconds)
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 15;

/// Deadline for the artifact download and the render stage (seconds)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// Grace added on top of `spec.interval` to form the apply budget (seconds)
pub const DEFAULT_APPLY_GRACE_SECS: u64 = 1;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Default maximum number of reconciliations running at once
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: u16 = 10;

/// Minimum backoff after a failed reconciliation (minutes)
pub const ERROR_BACKOFF_MIN_MINUTES: u64 = 1;

/// Maximum backoff after repeated failed reconciliations (minutes)
pub const ERROR_BACKOFF_MAX_MINUTES: u64 = 10;

/// Default templating binary
pub const DEFAULT_KUSTOMIZE_BIN: &str = "kustomize";

/// Default cluster apply binary
pub const DEFAULT_KUBECTL_BIN: &str = "kubectl";

/// Annotation whose changed value requests an immediate sync
pub const SYNC_AT_ANNOTATION: &str = "kustomize.fluxcd.io/syncAt";

/// Longest requeue handed to the controller runtime (one year)
pub const MAX_REQUEUE_SECS: u64 = 365 * 24 * 60 * 60;

/// Field manager name used for status patches
pub const FIELD_MANAGER: &str = "kustomize-controller";

/// Kind of the only supported artifact source
pub const GIT_REPOSITORY_KIND: &str = "GitRepository";

/// API group of the artifact source
pub const SOURCE_API_GROUP: &str = "source.toolkit.fluxcd.io";

/// API version of the artifact source
pub const SOURCE_API_VERSION: &str = "v1alpha1";

/// Upper bound on external tool output copied into a condition message (bytes)
pub const MAX_CONDITION_OUTPUT_BYTES: usize = 16 * 1024;
