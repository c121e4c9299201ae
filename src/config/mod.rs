//! # Configuration
//!
//! Controller-level configuration, read once at startup from the environment.

mod controller;

pub use controller::ControllerConfig;
