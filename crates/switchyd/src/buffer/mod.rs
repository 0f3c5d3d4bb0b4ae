//! Buffer pools, profiles and their queue/PG/port bindings.

mod orch;

pub use orch::{BufferOrch, BUFFER_TABLES};
