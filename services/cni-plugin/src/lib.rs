//! vxnet CNI plugin.
//!
//! Invoked by the container runtime once per container lifecycle event:
//! - ADD: ensure the node bridge, reserve an address, wire a veth pair
//! - DEL: release the container's address
//! - CHECK: accepted without verification
//! - VERSION: report supported CNI versions

pub mod bridge;
pub mod commands;
pub mod ipam;
pub mod logging;
pub mod protocol;
pub mod veth;

pub use commands::Plugin;
pub use ipam::{Allocation, Ledger, DEFAULT_LEDGER_PATH};
pub use protocol::{CniArgs, Command, ErrorResult, NetConf};
