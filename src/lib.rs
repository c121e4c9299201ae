//! Kustomize Controller Library
//!
//! Core functionality of the Kustomize Controller: the `Kustomization`
//! custom resource, the reconciler and sync pipeline, and the runtime that
//! wires them into kube-runtime.
//!
//! The external seams (resource store, source resolver, artifact fetcher and
//! command executor) are traits, so the reconciler and the pipeline can be
//! driven without a cluster or real tool binaries.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
