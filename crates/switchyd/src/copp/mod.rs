//! Control-plane policing: trap groups, trap ids and policers.

mod orch;

pub use orch::CoppOrch;
