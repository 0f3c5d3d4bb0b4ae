//! Port catalog: the canonical registry of physical, LAG, VLAN and
//! CPU ports and their driver handles.

mod orch;
mod port;

pub use orch::PortsOrch;
pub use port::{Port, PortKind};
