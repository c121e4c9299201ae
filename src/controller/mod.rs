//! # Controller
//!
//! Core controller modules for the Kustomize Controller.
//!
//! - `backoff`: Fibonacci backoff for failed reconciliations
//! - `exec`: external command execution with timeouts
//! - `lock`: per-resource sync locks
//! - `workspace`: ephemeral per-sync directories
//! - `sync`: the fetch / render / apply / health-check pipeline
//! - `reconciler`: reconciliation entry point and status computation
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod exec;
pub mod lock;
pub mod reconciler;
pub mod server;
pub mod sync;
pub mod workspace;
