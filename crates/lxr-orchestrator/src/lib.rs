//! # lxr-orchestrator
//!
//! Provisioning orchestrator for lxr.
//!
//! This crate provides:
//! - The pure lifecycle state machine
//! - The cleanup guard that destroys partially built sandboxes
//! - The in-sandbox network readiness check
//! - Command plans for package installation and agent setup
//! - The [`Provisioner`], which drives a request through every stage

mod commands;
mod error;
mod guard;
mod network;
mod provisioner;
mod state_machine;

pub use commands::{service_running, CommandPlan};
pub use error::{CleanupOutcome, ErrorKind, ProvisionError};
pub use guard::{teardown, CleanupGuard};
pub use network::{NetworkProbe, NetworkStatus};
pub use provisioner::{ProvisionReport, Provisioner, StageTiming};
pub use state_machine::{transition, Action, Event, RunState};
