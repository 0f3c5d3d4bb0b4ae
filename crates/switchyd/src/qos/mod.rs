//! QoS maps, WRED and scheduler profiles, per-port QoS application.

mod orch;

pub use orch::{QosOrch, QOS_TABLES};
