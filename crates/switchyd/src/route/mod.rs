//! Routes and ECMP next-hop groups.

mod nhg;
mod orch;

pub use nhg::{NextHopGroupEntry, NextHopGroupKey};
pub use orch::RouteOrch;
