//! # lxr-host
//!
//! Virtualization host layer for lxr.
//!
//! This crate provides:
//! - The `HostApi` trait the orchestrator drives containers through
//! - A Proxmox VE implementation shelling out to `pct`, `pvesh` and `pvesm`
//! - Structured in-container commands (`ExecRequest`)
//! - `MockHost` for tests

mod command;
mod exec;
mod mock;

pub use command::{
    parse_bridges, parse_next_id, parse_storage_status, AllocationSpec, HostApi, PctHost,
    StorageInfo,
};
pub use exec::{ExecOutput, ExecRequest};
pub use mock::{HostCall, HostOp, MockHost};
