//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `kustomize_controller_reconciliations_total` - Total number of reconciliations
//! - `kustomize_controller_reconciliation_errors_total` - Reconciliation errors by kind
//! - `kustomize_controller_reconciliation_duration_seconds` - Duration of reconciliations
//! - `kustomize_controller_requeues_total` - Requeues by reason
//! - `kustomize_controller_sync_failures_total` - Failed syncs by condition reason
//! - `kustomize_controller_apply_duration_seconds` - Duration of `kubectl apply`
//! - `kustomize_controller_artifact_downloads_total` - Artifact downloads started
//! - `kustomize_controller_artifact_download_errors_total` - Failed artifact downloads
//! - `kustomize_controller_artifact_download_duration_seconds` - Download and extract duration
//! - `kustomize_controller_health_checks_total` - Health checks by result

use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "kustomize_controller_reconciliation_errors_total",
            "Total number of reconciliation errors by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "kustomize_controller_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "kustomize_controller_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static SYNC_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "kustomize_controller_sync_failures_total",
            "Total number of failed syncs by condition reason",
        ),
        &["reason"],
    )
    .expect("Failed to create SYNC_FAILURES_TOTAL metric - this should never happen")
});

static APPLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "kustomize_controller_apply_duration_seconds",
            "Duration of kubectl apply in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create APPLY_DURATION metric - this should never happen")
});

static ARTIFACT_DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_artifact_downloads_total",
        "Total number of artifact downloads",
    )
    .expect("Failed to create ARTIFACT_DOWNLOADS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_controller_artifact_download_errors_total",
        "Total number of failed artifact downloads",
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_ERRORS_TOTAL metric - this should never happen")
});

static ARTIFACT_DOWNLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "kustomize_controller_artifact_download_duration_seconds",
            "Duration of artifact download and extraction in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 15.0]),
    )
    .expect("Failed to create ARTIFACT_DOWNLOAD_DURATION metric - this should never happen")
});

static HEALTH_CHECKS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "kustomize_controller_health_checks_total",
            "Total number of workload health checks by result",
        ),
        &["result"],
    )
    .expect("Failed to create HEALTH_CHECKS_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(APPLY_DURATION.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ARTIFACT_DOWNLOAD_DURATION.clone()))?;
    REGISTRY.register(Box::new(HEALTH_CHECKS_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn increment_sync_failures(reason: &str) {
    SYNC_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn observe_apply_duration(duration: f64) {
    APPLY_DURATION.observe(duration);
}

pub fn increment_artifact_downloads_total() {
    ARTIFACT_DOWNLOADS_TOTAL.inc();
}

pub fn increment_artifact_download_errors_total() {
    ARTIFACT_DOWNLOAD_ERRORS_TOTAL.inc();
}

pub fn observe_artifact_download_duration(duration: f64) {
    ARTIFACT_DOWNLOAD_DURATION.observe(duration);
}

pub fn increment_health_checks(result: &str) {
    HEALTH_CHECKS_TOTAL.with_label_values(&[result]).inc();
}
