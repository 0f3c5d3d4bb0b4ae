//! Router interfaces: L3 anchors on ports, LAGs and VLANs.

mod orch;

pub use orch::IntfsOrch;
