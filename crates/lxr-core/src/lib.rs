//! # lxr-core
//!
//! Core types for lxr, the ephemeral CI runner provisioner.
//!
//! lxr creates a container on a virtualization host, configures it and
//! registers it as a CI runner. If any stage after allocation fails, the
//! container is destroyed again.
//!
//! ## Contents
//!
//! - Validated provisioning requests and the sandbox lifecycle states
//! - Retry policies with the bounded retry executor
//! - The readiness prober used to gate stages on remote conditions
//! - TOML configuration for static provisioning defaults

pub mod config;
mod error;
pub mod probe;
pub mod retry;
mod types;

pub use config::LxrConfig;
pub use error::{LxrError, Result};
pub use probe::{wait_until_ready, ProbeReport, Readiness};
pub use retry::run_with_retry;
pub use types::*;
