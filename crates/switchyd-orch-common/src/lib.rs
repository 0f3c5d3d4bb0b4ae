//! Orchestration base for the switchyd control plane.
//!
//! This crate carries the pieces every subsystem orchestrator builds
//! on:
//!
//! - [`Store`]: the in-process application store (per-table queues of
//!   (key, op, fields) tuples plus committed state) behind the single
//!   control-plane mutex
//! - [`Consumer`]: the per-table pending map with the pop merge policy
//! - [`TaskStatus`] / [`OrchError`]: the per-entry processing outcome
//! - [`SyncMap`]: refcounted object tables that never auto-create
//! - reference-resolution helpers for `[TABLE:NAME]` fields
//! - [`Recorder`]: the popped-tuple record log with rotation

mod consumer;
mod recorder;
mod refs;
mod store;
mod sync_map;
mod task;

pub use consumer::{Consumer, FieldValues, KeyOpFieldValues, Operation};
pub use recorder::Recorder;
pub use refs::{
    parse_index_range, parse_reference, parse_u32_auto, resolve_field_ref,
    resolve_field_ref_array, RefArrayResolve, RefResolve, TypeMaps,
};
pub use store::Store;
pub use sync_map::{HasRefCount, SyncMap};
pub use task::{OrchError, OrchResult, TaskStatus};
