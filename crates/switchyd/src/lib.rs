//! switchyd - network state reconciliation daemon.
//!
//! The daemon subscribes to desired-state tables in the application
//! store and reconciles them against a switch abstraction driver
//! (SAD), maintaining referential integrity across subsystems:
//!
//! ```text
//! [store] --> [OrchDaemon] --> per-table do_task --> [SwitchDriver]
//!                  |
//!                  +--> observer fabric (typed updates between
//!                       subsystems: next hop, neighbor, FDB,
//!                       LAG/VLAN membership, mirror state)
//! ```
//!
//! One subsystem module per concern; each owns a flat table keyed by
//! a semantic identity and connects to its siblings only through
//! reference counts and queued updates.

pub mod acl;
pub mod buffer;
pub mod context;
pub mod copp;
pub mod daemon;
pub mod fdb;
pub mod intfs;
pub mod mirror;
pub mod neigh;
pub mod observer;
pub mod ports;
pub mod qos;
pub mod route;
pub mod tables;

pub use context::SwitchContext;
pub use daemon::{DaemonConfig, OrchDaemon};
