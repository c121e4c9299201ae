//! # Custom Resource Definitions
//!
//! CRD types for the Kustomize Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - Main CRD specification and default values
//! - `source.rs` - Source and workload references
//! - `status.rs` - Status types for tracking reconciliation state

mod source;
mod spec;
mod status;

// Re-export all public types
pub use source::{default_source_kind, SourceRef, WorkloadReference};
pub use spec::{default_false, default_path, Kustomization, KustomizationSpec};
pub use status::{Condition, KustomizationStatus, READY_CONDITION};
