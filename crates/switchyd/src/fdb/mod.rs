//! Forwarding database: the MAC/VLAN table backing L2 lookups.

mod orch;

pub use orch::FdbOrch;
