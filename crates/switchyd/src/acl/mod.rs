//! ACL tables, rules, shared range objects and the counter collector.

mod counter;
mod orch;
mod range;
mod rule;
mod table;

pub use counter::{CounterCollector, CounterHub, CounterRow, COUNTERS_READ_INTERVAL};
pub use orch::AclOrch;
pub use range::AclRangeCache;
pub use rule::{AclRule, L3PacketAction, RedirectTarget, RuleAction};
pub use table::{AclTable, AclTableKind};
