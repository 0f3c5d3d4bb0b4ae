//! ERSPAN mirror sessions resolved over route, neighbor, port, LAG
//! and FDB state.

mod orch;

pub use orch::{MirrorEntry, MirrorOrch};
